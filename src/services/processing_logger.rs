//! Processing analytics logger.
//!
//! Records every processing step for an item so that a classification can be
//! reproduced after the fact: which steps ran, in which order, with which
//! model, and what each one decided. All steps of one ingestion run share a
//! correlation id.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

use crate::models::ProcessingStepType;
use crate::store::StoreError;

pub struct ProcessingLogger {
    pool: SqlitePool,
    run_id: String,
    step_order: AtomicI64,
}

impl ProcessingLogger {
    /// New logger with a fresh correlation id.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_run_id(pool, Uuid::new_v4().to_string())
    }

    pub fn with_run_id(pool: SqlitePool, run_id: String) -> Self {
        Self { pool, run_id, step_order: AtomicI64::new(0) }
    }

    /// Fresh correlation id for a new item within the same batch.
    pub fn new_item_run(&self) -> Self {
        Self::new(self.pool.clone())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Start building a step record. Steps are numbered in call order.
    pub fn step(&self, step_type: ProcessingStepType) -> StepRecord<'_> {
        StepRecord {
            logger: self,
            step_type,
            item_id: None,
            duration_ms: None,
            model_name: None,
            model_provider: None,
            confidence_score: None,
            priority_input: None,
            priority_output: None,
            ak_suggestions: None,
            ak_primary: None,
            ak_confidence: None,
            relevant: None,
            relevance_score: None,
            success: true,
            skipped: false,
            skip_reason: None,
            error_message: None,
            input_data: None,
            output_data: None,
        }
    }
}

/// One processing-step record under construction.
pub struct StepRecord<'a> {
    logger: &'a ProcessingLogger,
    step_type: ProcessingStepType,
    item_id: Option<i64>,
    duration_ms: Option<i64>,
    model_name: Option<String>,
    model_provider: Option<String>,
    confidence_score: Option<f64>,
    priority_input: Option<String>,
    priority_output: Option<String>,
    ak_suggestions: Option<Vec<String>>,
    ak_primary: Option<String>,
    ak_confidence: Option<f64>,
    relevant: Option<bool>,
    relevance_score: Option<f64>,
    success: bool,
    skipped: bool,
    skip_reason: Option<String>,
    error_message: Option<String>,
    input_data: Option<Value>,
    output_data: Option<Value>,
}

impl StepRecord<'_> {
    pub fn item(mut self, item_id: i64) -> Self {
        self.item_id = Some(item_id);
        self
    }

    pub fn duration_ms(mut self, ms: i64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn model(mut self, name: &str, provider: &str) -> Self {
        self.model_name = Some(name.to_string());
        self.model_provider = Some(provider.to_string());
        self
    }

    pub fn confidence(mut self, score: f64) -> Self {
        self.confidence_score = Some(score);
        self
    }

    pub fn priorities(mut self, input: Option<&str>, output: Option<&str>) -> Self {
        self.priority_input = input.map(str::to_string);
        self.priority_output = output.map(str::to_string);
        self
    }

    pub fn aks(mut self, suggestions: &[String], confidence: Option<f64>) -> Self {
        self.ak_primary = suggestions.first().cloned();
        self.ak_suggestions = Some(suggestions.to_vec());
        self.ak_confidence = confidence;
        self
    }

    pub fn relevance(mut self, relevant: Option<bool>, score: Option<f64>) -> Self {
        self.relevant = relevant;
        self.relevance_score = score;
        self
    }

    pub fn skipped(mut self, reason: &str) -> Self {
        self.skipped = true;
        self.skip_reason = Some(reason.to_string());
        self
    }

    pub fn failed(mut self, error: &str) -> Self {
        self.success = false;
        self.error_message = Some(error.to_string());
        self
    }

    pub fn input(mut self, data: Value) -> Self {
        self.input_data = Some(data);
        self
    }

    pub fn output(mut self, data: Value) -> Self {
        self.output_data = Some(data);
        self
    }

    /// Persist the record. Logging never interrupts processing: the caller
    /// decides whether to tolerate the error.
    pub async fn save(self) -> Result<(), StoreError> {
        let step_order = self.logger.step_order.fetch_add(1, Ordering::Relaxed) + 1;
        let priority_changed = match (&self.priority_input, &self.priority_output) {
            (Some(input), Some(output)) => input != output,
            _ => false,
        };

        sqlx::query(
            r#"INSERT INTO item_processing_logs
               (item_id, processing_run_id, step_type, step_order, started_at, completed_at,
                duration_ms, model_name, model_provider, confidence_score,
                priority_input, priority_output, priority_changed,
                ak_suggestions, ak_primary, ak_confidence, relevant, relevance_score,
                success, skipped, skip_reason, error_message, input_data, output_data)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(self.item_id)
        .bind(&self.logger.run_id)
        .bind(self.step_type)
        .bind(step_order)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(self.duration_ms)
        .bind(&self.model_name)
        .bind(&self.model_provider)
        .bind(self.confidence_score)
        .bind(&self.priority_input)
        .bind(&self.priority_output)
        .bind(priority_changed)
        .bind(self.ak_suggestions.as_ref().map(|s| serde_json::to_string(s).unwrap_or_default()))
        .bind(&self.ak_primary)
        .bind(self.ak_confidence)
        .bind(self.relevant)
        .bind(self.relevance_score)
        .bind(self.success)
        .bind(self.skipped)
        .bind(&self.skip_reason)
        .bind(&self.error_message)
        .bind(self.input_data.as_ref().map(|d| d.to_string()))
        .bind(self.output_data.as_ref().map(|d| d.to_string()))
        .execute(&self.logger.pool)
        .await?;

        Ok(())
    }
}

/// Prune processing logs older than the cutoff. Housekeeping.
pub async fn prune_logs_before(
    pool: &SqlitePool,
    cutoff: chrono::DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM item_processing_logs WHERE created_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
