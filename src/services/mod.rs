pub mod classifier;
pub mod classifier_worker;
pub mod gpu_power;
pub mod housekeeping;
pub mod llm;
pub mod llm_worker;
pub mod pipeline;
pub mod processing_logger;
pub mod processor;
pub mod scheduler;
pub mod worker_status;

pub use classifier::{Classifier, ClassifierError, HttpClassifier};
pub use classifier_worker::ClassifierWorker;
pub use gpu_power::{EnsureOutcome, GpuPowerManager};
pub use housekeeping::start_housekeeping_task;
pub use llm::{LlmError, LlmProvider, LlmService, OllamaProvider, OpenRouterProvider};
pub use llm_worker::LlmWorker;
pub use pipeline::IngestPipeline;
pub use processing_logger::ProcessingLogger;
pub use processor::ItemProcessor;
pub use scheduler::{FetchError, FetchScheduler, start_fetch_scheduler};
pub use worker_status::WorkerStatusRepository;
