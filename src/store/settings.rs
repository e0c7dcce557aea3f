//! Runtime settings repository.

use serde_json::Value;
use sqlx::SqlitePool;

use super::StoreError;
use crate::models::Setting;

pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Setting>, StoreError> {
        let setting = sqlx::query_as::<_, Setting>("SELECT * FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(setting)
    }

    pub async fn set(
        &self,
        key: &str,
        value: &Value,
        description: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO settings (key, value, description, updated_at)
               VALUES (?, ?, ?, CURRENT_TIMESTAMP)
               ON CONFLICT (key) DO UPDATE
               SET value = excluded.value, updated_at = CURRENT_TIMESTAMP"#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Boolean setting with a fallback when absent or not a boolean.
    pub async fn get_bool(&self, key: &str, default: bool) -> Result<bool, StoreError> {
        let setting = self.get(key).await?;
        Ok(setting
            .and_then(|s| match &s.value {
                Value::Bool(b) => Some(*b),
                Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
                _ => None,
            })
            .unwrap_or(default))
    }

    /// Integer setting with a fallback when absent or not numeric.
    pub async fn get_i64(&self, key: &str, default: i64) -> Result<i64, StoreError> {
        let setting = self.get(key).await?;
        Ok(setting.and_then(|s| s.value.as_i64()).unwrap_or(default))
    }
}
