// Test modules

pub mod common;

mod classifier_worker_test;
mod llm_worker_test;
mod pipeline_test;
mod worker_status_test;
