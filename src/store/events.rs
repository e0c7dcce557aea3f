//! Item audit-event repository. Append-only.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use super::StoreError;
use crate::models::ItemEvent;

pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        item_id: i64,
        event_type: &str,
        data: Option<&Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO item_events (item_id, event_type, timestamp, data)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(item_id)
        .bind(event_type)
        .bind(Utc::now())
        .bind(data.map(|d| d.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record many events in one transaction.
    pub async fn record_batch(
        &self,
        events: &[(i64, &str, Option<Value>)],
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (item_id, event_type, data) in events {
            sqlx::query(
                r#"INSERT INTO item_events (item_id, event_type, timestamp, data)
                   VALUES (?, ?, ?, ?)"#,
            )
            .bind(item_id)
            .bind(event_type)
            .bind(Utc::now())
            .bind(data.as_ref().map(|d| d.to_string()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn for_item(&self, item_id: i64) -> Result<Vec<ItemEvent>, StoreError> {
        let events = sqlx::query_as::<_, ItemEvent>(
            "SELECT * FROM item_events WHERE item_id = ? ORDER BY timestamp DESC",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Prune events older than the cutoff. Housekeeping.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM item_events WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
