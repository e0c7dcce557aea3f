//! Channel and source repository.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use super::StoreError;
use crate::models::{Channel, ChannelWithSource, ConnectorType, Source};

pub struct ChannelRepository {
    pool: SqlitePool,
}

impl ChannelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i64) -> Result<Option<Channel>, StoreError> {
        let channel = sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(channel)
    }

    pub async fn get_with_source(
        &self,
        id: i64,
    ) -> Result<Option<ChannelWithSource>, StoreError> {
        let channel = sqlx::query_as::<_, ChannelWithSource>(
            r#"SELECT c.*, s.name AS source_name, s.enabled AS source_enabled,
                      s.is_stakeholder AS source_is_stakeholder
               FROM channels c
               JOIN sources s ON c.source_id = s.id
               WHERE c.id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(channel)
    }

    /// Channels due for a fetch: effectively enabled and past their interval
    /// (or never fetched).
    pub async fn due_channels(&self, now: DateTime<Utc>) -> Result<Vec<ChannelWithSource>, StoreError> {
        let channels = sqlx::query_as::<_, ChannelWithSource>(
            r#"SELECT c.*, s.name AS source_name, s.enabled AS source_enabled,
                      s.is_stakeholder AS source_is_stakeholder
               FROM channels c
               JOIN sources s ON c.source_id = s.id
               WHERE c.enabled = TRUE AND s.enabled = TRUE
                 AND (c.last_fetch_at IS NULL
                      OR datetime(c.last_fetch_at, '+' || c.fetch_interval_minutes || ' minutes') <= datetime(?))
               ORDER BY c.last_fetch_at ASC"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(channels)
    }

    /// Record a fetch attempt outcome: timestamp always, error on failure
    /// (cleared on success).
    pub async fn record_fetch_result(
        &self,
        channel_id: i64,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE channels
               SET last_fetch_at = ?, last_error = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(Utc::now())
        .bind(error)
        .bind(Utc::now())
        .bind(channel_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_source(
        &self,
        name: &str,
        description: Option<&str>,
        is_stakeholder: bool,
    ) -> Result<Source, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO sources (name, description, is_stakeholder, enabled)
               VALUES (?, ?, ?, TRUE)"#,
        )
        .bind(name)
        .bind(description)
        .bind(is_stakeholder)
        .execute(&self.pool)
        .await?;

        let source = sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;
        Ok(source)
    }

    /// Create a channel; the source identifier is derived from the config so
    /// the unique constraint can reject duplicate feeds.
    pub async fn create_channel(
        &self,
        source_id: i64,
        name: Option<&str>,
        connector_type: ConnectorType,
        config: &Value,
        fetch_interval_minutes: i64,
    ) -> Result<Channel, StoreError> {
        let source_identifier = Channel::extract_identifier(connector_type, config);

        let result = sqlx::query(
            r#"INSERT INTO channels
               (source_id, name, connector_type, config, source_identifier,
                enabled, fetch_interval_minutes)
               VALUES (?, ?, ?, ?, ?, TRUE, ?)"#,
        )
        .bind(source_id)
        .bind(name)
        .bind(connector_type)
        .bind(config.to_string())
        .bind(source_identifier)
        .bind(fetch_interval_minutes)
        .execute(&self.pool)
        .await?;

        let channel = sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;
        Ok(channel)
    }
}
