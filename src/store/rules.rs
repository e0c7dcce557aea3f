//! Rule repository.

use serde_json::Value;
use sqlx::SqlitePool;

use super::StoreError;
use crate::models::Rule;

pub struct RuleRepository {
    pool: SqlitePool,
}

impl RuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enabled rules in deterministic application order.
    pub async fn enabled_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let rules = sqlx::query_as::<_, Rule>(
            "SELECT * FROM rules WHERE enabled = TRUE ORDER BY sort_order, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    pub async fn record_match(
        &self,
        item_id: i64,
        rule_id: i64,
        details: Option<&Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO item_rule_matches (item_id, rule_id, match_details)
               VALUES (?, ?, ?)"#,
        )
        .bind(item_id)
        .bind(rule_id)
        .bind(details.map(|d| d.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
