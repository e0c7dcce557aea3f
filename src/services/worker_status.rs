//! Cross-process worker coordination through the database.
//!
//! Non-leader processes and the admin surface never talk to the workers
//! directly. They write a command row; the leader's workers poll, execute,
//! and clear it, and sync their state/stats rows at the same cadence.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::models::{SETTING_WORKER_POLL_INTERVAL, WorkerAction, WorkerState};
use crate::store::{SettingsRepository, StoreError};

pub struct WorkerStatusRepository {
    pool: SqlitePool,
    settings: SettingsRepository,
}

impl WorkerStatusRepository {
    pub fn new(pool: SqlitePool) -> Self {
        let settings = SettingsRepository::new(pool.clone());
        Self { pool, settings }
    }

    /// Upsert the state row for a worker.
    pub async fn write_state(
        &self,
        worker: &str,
        running: bool,
        paused: bool,
        stopped_due_to_errors: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO worker_state (worker, running, paused, stopped_due_to_errors, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT (worker) DO UPDATE
               SET running = excluded.running,
                   paused = excluded.paused,
                   stopped_due_to_errors = excluded.stopped_due_to_errors,
                   updated_at = excluded.updated_at"#,
        )
        .bind(worker)
        .bind(running)
        .bind(paused)
        .bind(stopped_due_to_errors)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert the stats row for a worker.
    pub async fn write_stats<S: Serialize>(
        &self,
        worker: &str,
        stats: &S,
    ) -> Result<(), StoreError> {
        let blob = serde_json::to_string(stats)?;
        sqlx::query(
            r#"INSERT INTO worker_stats (worker, stats, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT (worker) DO UPDATE
               SET stats = excluded.stats, updated_at = excluded.updated_at"#,
        )
        .bind(worker)
        .bind(blob)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Issue a command to a worker (one pending command per worker; a newer
    /// command replaces an unconsumed one).
    pub async fn issue_command(
        &self,
        worker: &str,
        action: WorkerAction,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO worker_commands (worker, action, issued_at)
               VALUES (?, ?, ?)
               ON CONFLICT (worker) DO UPDATE
               SET action = excluded.action, issued_at = excluded.issued_at"#,
        )
        .bind(worker)
        .bind(action.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read and clear the pending command for a worker, if any.
    pub async fn read_and_clear_command(
        &self,
        worker: &str,
    ) -> Result<Option<WorkerAction>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT action FROM worker_commands WHERE worker = ?")
                .bind(worker)
                .fetch_optional(&self.pool)
                .await?;

        let Some((action,)) = row else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM worker_commands WHERE worker = ?")
            .bind(worker)
            .execute(&self.pool)
            .await?;

        Ok(WorkerAction::parse_action(&action))
    }

    /// Current states of all workers.
    pub async fn all_states(&self) -> Result<Vec<WorkerState>, StoreError> {
        let states = sqlx::query_as::<_, WorkerState>("SELECT * FROM worker_state ORDER BY worker")
            .fetch_all(&self.pool)
            .await?;
        Ok(states)
    }

    /// Last-synced stats blob for a worker.
    pub async fn stats_blob(&self, worker: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT stats FROM worker_stats WHERE worker = ?")
                .bind(worker)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(blob,)| serde_json::from_str(&blob).ok()))
    }

    /// Poll cadence in seconds; the runtime setting overrides the default.
    pub async fn poll_interval_secs(&self, default: u64) -> u64 {
        match self.settings.get_i64(SETTING_WORKER_POLL_INTERVAL, default as i64).await {
            Ok(value) if value > 0 => value as u64,
            _ => default,
        }
    }
}
