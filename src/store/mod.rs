//! Repositories: one per aggregate, owning its SQL.

pub mod channels;
pub mod events;
pub mod items;
pub mod rules;
pub mod settings;

pub use channels::ChannelRepository;
pub use events::EventRepository;
pub use items::{ItemRepository, ItemWithContext, NewItem};
pub use rules::RuleRepository;
pub use settings::SettingsRepository;

/// Storage-layer error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
