//! Item repository.
//!
//! All background workers go through this repository. Writes are per-item;
//! concurrent classifier/LLM updates touch disjoint scalar columns and
//! disjoint metadata subtrees, so no cross-process locking is needed beyond
//! the leader lock.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashSet;

use super::StoreError;
use crate::models::{EVENT_FETCHED, Item, ItemMetadata, Priority};

/// Fields for a new item produced by the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub channel_id: i64,
    pub external_id: String,
    pub title: String,
    pub content: String,
    pub url: String,
    pub author: Option<String>,
    pub published_at: DateTime<Utc>,
    pub content_hash: String,
    pub priority: Priority,
    pub priority_score: i64,
    pub assigned_aks: Vec<String>,
    pub metadata: ItemMetadata,
    pub needs_llm_processing: bool,
    pub similar_to_id: Option<i64>,
}

/// Item joined with its channel and source names (for prompts and logging).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ItemWithContext {
    #[sqlx(flatten)]
    pub item: Item,
    pub channel_name: Option<String>,
    pub source_name: Option<String>,
}

pub struct ItemRepository {
    pool: SqlitePool,
}

impl ItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// True if the channel already carries this external id or content hash.
    /// Intake-level duplicate detection.
    pub async fn exists_in_channel(
        &self,
        channel_id: i64,
        external_id: &str,
        content_hash: &str,
    ) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"SELECT id FROM items
               WHERE channel_id = ? AND (external_id = ? OR content_hash = ?)
               LIMIT 1"#,
        )
        .bind(channel_id)
        .bind(external_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Insert a new item together with its `fetched` audit event, atomically.
    pub async fn insert(&self, new: &NewItem) -> Result<i64, StoreError> {
        let metadata_json = serde_json::to_string(&new.metadata)?;
        let aks_json = serde_json::to_string(&new.assigned_aks)?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"INSERT INTO items
               (channel_id, external_id, title, content, url, author, published_at,
                fetched_at, content_hash, priority, priority_score, assigned_aks,
                metadata, needs_llm_processing, similar_to_id)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(new.channel_id)
        .bind(&new.external_id)
        .bind(&new.title)
        .bind(&new.content)
        .bind(&new.url)
        .bind(&new.author)
        .bind(new.published_at)
        .bind(Utc::now())
        .bind(&new.content_hash)
        .bind(new.priority)
        .bind(new.priority_score)
        .bind(aks_json)
        .bind(metadata_json)
        .bind(new.needs_llm_processing)
        .bind(new.similar_to_id)
        .execute(&mut *tx)
        .await?;

        let item_id = result.last_insert_rowid();

        sqlx::query(
            r#"INSERT INTO item_events (item_id, event_type, timestamp, data)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(item_id)
        .bind(EVENT_FETCHED)
        .bind(Utc::now())
        .bind(serde_json::json!({"url": new.url}).to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(item_id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Item>, StoreError> {
        let item = sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    /// Load an item together with its channel and source names.
    pub async fn get_with_context(&self, id: i64) -> Result<Option<ItemWithContext>, StoreError> {
        let item = sqlx::query_as::<_, ItemWithContext>(
            r#"SELECT i.*, c.name AS channel_name, s.name AS source_name
               FROM items i
               LEFT JOIN channels c ON i.channel_id = c.id
               LEFT JOIN sources s ON c.source_id = s.id
               WHERE i.id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    /// Items never classified (no `pre_filter` in metadata), newest first.
    pub async fn unclassified(&self, limit: i64) -> Result<Vec<ItemWithContext>, StoreError> {
        let items = sqlx::query_as::<_, ItemWithContext>(
            r#"SELECT i.*, c.name AS channel_name, s.name AS source_name
               FROM items i
               LEFT JOIN channels c ON i.channel_id = c.id
               LEFT JOIN sources s ON c.source_id = s.id
               WHERE json_extract(i.metadata, '$.pre_filter') IS NULL
               ORDER BY i.fetched_at DESC
               LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Items missing from the vector index, newest first.
    pub async fn unindexed(&self, limit: i64) -> Result<Vec<ItemWithContext>, StoreError> {
        let items = sqlx::query_as::<_, ItemWithContext>(
            r#"SELECT i.*, c.name AS channel_name, s.name AS source_name
               FROM items i
               LEFT JOIN channels c ON i.channel_id = c.id
               LEFT JOIN sources s ON c.source_id = s.id
               WHERE json_extract(i.metadata, '$.vectordb_indexed') IS NULL
               ORDER BY i.fetched_at DESC
               LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Unlinked items whose duplicate check has not completed yet.
    /// `cutoff` bounds the scan to recently fetched items.
    pub async fn unchecked_duplicates(
        &self,
        limit: i64,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<Item>, StoreError> {
        let items = if let Some(cutoff) = cutoff {
            sqlx::query_as::<_, Item>(
                r#"SELECT * FROM items
                   WHERE similar_to_id IS NULL
                     AND json_extract(metadata, '$.duplicate_checked') IS NULL
                     AND fetched_at >= ?
                   ORDER BY fetched_at DESC
                   LIMIT ?"#,
            )
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, Item>(
                r#"SELECT * FROM items
                   WHERE similar_to_id IS NULL
                     AND json_extract(metadata, '$.duplicate_checked') IS NULL
                   ORDER BY fetched_at DESC
                   LIMIT ?"#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(items)
    }

    /// LLM backlog selection.
    ///
    /// Only classified items qualify (the classifier must run first so LLM
    /// cycles are not spent on certainly-irrelevant items). Within the
    /// backlog, retry priority orders the work; `low` items are excluded
    /// unless they are relevance-bearing without an assigned working group.
    pub async fn backlog_ids(&self, limit: i64) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"SELECT id FROM items
               WHERE json_extract(metadata, '$.pre_filter') IS NOT NULL
                 AND (
                   (needs_llm_processing = TRUE
                    AND (json_extract(metadata, '$.retry_priority') IS NULL
                         OR json_extract(metadata, '$.retry_priority') != 'low'))
                   OR
                   (priority != 'none'
                    AND (json_extract(metadata, '$.llm_analysis.assigned_aks') IS NULL
                         OR json_extract(metadata, '$.llm_analysis.assigned_aks') = '[]'))
                 )
               ORDER BY
                 CASE json_extract(metadata, '$.retry_priority')
                   WHEN 'high' THEN 1
                   WHEN 'edge_case' THEN 2
                   WHEN 'low' THEN 3
                   ELSE 4
                 END,
                 fetched_at DESC
               LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Oldest item with the same URL on a *different* channel and a strictly
    /// smaller id, if any. URL-equality duplicate detection.
    pub async fn url_duplicate_of(
        &self,
        url: &str,
        item_id: i64,
        channel_id: Option<i64>,
    ) -> Result<Option<i64>, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"SELECT id FROM items
               WHERE url = ? AND id < ? AND (channel_id IS NULL OR channel_id != ?)
               ORDER BY id
               LIMIT 1"#,
        )
        .bind(url)
        .bind(item_id)
        .bind(channel_id.unwrap_or(-1))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Which of the given ids actually exist. Used to clear stale vector
    /// store pointers before committing duplicate links.
    pub async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id FROM items WHERE id IN ({})", placeholders);
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Apply classifier results: priority, score, metadata, retry flag.
    pub async fn apply_classification(
        &self,
        item_id: i64,
        priority: Priority,
        priority_score: i64,
        metadata: &ItemMetadata,
        needs_llm_processing: bool,
    ) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(metadata)?;
        sqlx::query(
            r#"UPDATE items
               SET priority = ?, priority_score = ?, metadata = ?, needs_llm_processing = ?
               WHERE id = ?"#,
        )
        .bind(priority)
        .bind(priority_score)
        .bind(metadata_json)
        .bind(needs_llm_processing)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply LLM analysis results and clear the retry flag.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_llm_analysis(
        &self,
        item_id: i64,
        summary: Option<&str>,
        detailed_analysis: Option<&str>,
        priority: Priority,
        priority_score: i64,
        assigned_aks: &[String],
        metadata: &ItemMetadata,
    ) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(metadata)?;
        let aks_json = serde_json::to_string(assigned_aks)?;
        sqlx::query(
            r#"UPDATE items
               SET summary = COALESCE(?, summary),
                   detailed_analysis = COALESCE(?, detailed_analysis),
                   priority = ?,
                   priority_score = ?,
                   assigned_aks = ?,
                   metadata = ?,
                   needs_llm_processing = FALSE
               WHERE id = ?"#,
        )
        .bind(summary)
        .bind(detailed_analysis)
        .bind(priority)
        .bind(priority_score)
        .bind(aks_json)
        .bind(metadata_json)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set (or clear) the duplicate link and write the updated metadata.
    ///
    /// Callers must guarantee `similar_to_id < item_id`; the smaller-id
    /// invariant precludes cycles by construction.
    pub async fn set_duplicate_link(
        &self,
        item_id: i64,
        similar_to_id: Option<i64>,
        metadata: &ItemMetadata,
    ) -> Result<(), StoreError> {
        debug_assert!(similar_to_id.is_none_or(|dup| dup < item_id));
        let metadata_json = serde_json::to_string(metadata)?;
        sqlx::query("UPDATE items SET similar_to_id = ?, metadata = ? WHERE id = ?")
            .bind(similar_to_id)
            .bind(metadata_json)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Overwrite the metadata column only.
    pub async fn update_metadata(
        &self,
        item_id: i64,
        metadata: &ItemMetadata,
    ) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(metadata)?;
        sqlx::query("UPDATE items SET metadata = ? WHERE id = ?")
            .bind(metadata_json)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Count of items flagged as present in the vector index.
    pub async fn indexed_count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM items
               WHERE json_extract(metadata, '$.vectordb_indexed') IS NOT NULL"#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Flag an item for another LLM pass. Returns false if the item does not
    /// exist.
    pub async fn mark_for_reprocessing(&self, item_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE items SET needs_llm_processing = TRUE WHERE id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Archive NONE-priority items fetched before the cutoff. Housekeeping.
    pub async fn archive_stale_irrelevant(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"UPDATE items
               SET is_archived = TRUE
               WHERE priority = 'none' AND is_archived = FALSE
                 AND is_starred = FALSE AND fetched_at < ?"#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
