use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use news_aggregator::config::Config;
use news_aggregator::connectors::ConnectorRegistry;
use news_aggregator::db;
use news_aggregator::leader::LeaderLock;
use news_aggregator::models::{WORKER_CLASSIFIER, WORKER_LLM, WORKER_SCHEDULER};
use news_aggregator::services::{
    ClassifierWorker, FetchScheduler, GpuPowerManager, HttpClassifier, IngestPipeline,
    ItemProcessor, LlmService, LlmWorker, OllamaProvider, OpenRouterProvider,
    WorkerStatusRepository, start_fetch_scheduler, start_housekeeping_task,
};
use news_aggregator::services::llm::LlmProvider;
use news_aggregator::{AppState, handlers};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    // The appender guard must outlive the server: dropping it stops the
    // writer thread and the file log goes dark.
    let mut _log_guard = None;

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("newsroom.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _log_guard = Some(guard);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    tracing::info!("Newsroom starting up");

    // Leader election: a stale lock from a crashed run is cleared first, then
    // exactly one process wins the create-new race. Only the leader runs
    // background workers; every process serves the API.
    LeaderLock::clear_stale(&config.leader.lock_path);
    let leader_lock = LeaderLock::try_acquire(&config.leader.lock_path);
    let is_leader = leader_lock.is_some();
    if is_leader {
        tracing::info!("Process {}: elected as leader, will run background tasks", std::process::id());
    } else {
        tracing::info!("Process {}: API-only mode (another process is leader)", std::process::id());
    }

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database pool created and migrations applied");

    let connector_registry = Arc::new(ConnectorRegistry::with_defaults());

    let classifier = Arc::new(HttpClassifier::new(
        &config.classifier.base_url,
        config.classifier.timeout_secs,
    ));

    // Fresh-queue fast path: pipeline produces, the LLM worker consumes.
    let (fresh_tx, fresh_rx) = mpsc::channel::<i64>(config.llm.fresh_queue_capacity);

    let pipeline = Arc::new(IngestPipeline::new(
        pool.clone(),
        classifier.clone(),
        fresh_tx.clone(),
        config.classifier.duplicate_threshold,
        config.classifier.boilerplate_prefixes.clone(),
    ));

    let scheduler = Arc::new(FetchScheduler::new(
        pool.clone(),
        Arc::clone(&connector_registry),
        Arc::clone(&pipeline),
        config.scheduler.max_parallel_fetches,
        config.workers.poll_interval_secs,
    ));

    let worker_status = Arc::new(WorkerStatusRepository::new(pool.clone()));

    let gpu_power = GpuPowerManager::from_config(&config.gpu, &config.llm.ollama_base_url)
        .map_err(|e| format!("Failed to initialize GPU power manager: {}", e))?;

    // Provider chain is built on every process: the leader's LLM worker
    // consumes it, and the status surface probes it for health reporting.
    let mut providers: Vec<Arc<dyn LlmProvider>> = vec![Arc::new(OllamaProvider::new(
        &config.llm.ollama_base_url,
        &config.llm.ollama_model,
        config.llm.ollama_timeout_secs,
    ))];
    if let Some(api_key) = &config.llm.openrouter_api_key {
        providers.push(Arc::new(OpenRouterProvider::new(
            api_key,
            &config.llm.openrouter_model,
            config.llm.openrouter_timeout_secs,
        )));
    }
    let llm_service = Arc::new(
        LlmService::new(providers)
            .map_err(|e| format!("Failed to initialize LLM service: {}", e))?,
    );

    let mut classifier_worker: Option<Arc<ClassifierWorker>> = None;
    let mut llm_worker: Option<Arc<LlmWorker>> = None;
    let mut housekeeping_handle = None;

    if is_leader {
        if config.workers.scheduler_enabled {
            start_fetch_scheduler(Arc::clone(&scheduler), config.scheduler.tick_secs);
            tracing::info!("Scheduler enabled and started");
        } else {
            worker_status.write_state(WORKER_SCHEDULER, false, false, false).await?;
            tracing::info!("Scheduler disabled by configuration");
        }

        if config.workers.classifier_enabled {
            let worker = Arc::new(ClassifierWorker::new(
                pool.clone(),
                classifier.clone(),
                config.classifier.clone(),
                &config.workers,
            ));
            Arc::clone(&worker).start();
            classifier_worker = Some(worker);
            tracing::info!("Classifier worker enabled and started");
        } else {
            worker_status.write_state(WORKER_CLASSIFIER, false, false, false).await?;
            tracing::info!("Classifier worker disabled by configuration");
        }

        if config.workers.llm_enabled {
            let worker = Arc::new(LlmWorker::new(
                pool.clone(),
                ItemProcessor::new(Arc::clone(&llm_service)),
                gpu_power.clone(),
                fresh_tx.clone(),
                fresh_rx,
                config.llm.clone(),
                config.workers.poll_interval_secs,
            ));
            Arc::clone(&worker).start();
            llm_worker = Some(worker);
            tracing::info!("LLM worker enabled and started");
        } else {
            worker_status.write_state(WORKER_LLM, false, false, false).await?;
            tracing::info!("LLM worker disabled by configuration");
        }

        if config.housekeeping.enabled {
            housekeeping_handle =
                Some(start_housekeeping_task(pool.clone(), config.housekeeping.clone()));
        }
    }

    let app_state = Arc::new(AppState {
        db: pool.clone(),
        is_leader,
        registry: Arc::clone(&connector_registry),
        scheduler: Arc::clone(&scheduler),
        worker_status: Arc::clone(&worker_status),
        gpu_power: gpu_power.clone(),
        llm: Arc::clone(&llm_service),
        fresh_tx: fresh_tx.clone(),
    });

    let api_routes = Router::new()
        .route("/api/workers/status", get(handlers::workers::get_status))
        .route("/api/workers/:name/command", post(handlers::workers::issue_command))
        .route("/api/connectors", get(handlers::channels::list_connectors))
        .route("/api/channels/validate", post(handlers::channels::validate_config))
        .route("/api/channels/:id/fetch", post(handlers::channels::fetch_now))
        .route("/api/items/:id/reprocess", post(handlers::items::reprocess))
        .with_state(app_state);

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check));

    let app = Router::new()
        .merge(api_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Newsroom is ready to serve requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown: only the leader winds down background workers; loops exit at
    // their next checkpoint and in-flight calls complete.
    if is_leader {
        tracing::info!("Leader shutting down background workers...");
        scheduler.request_stop().await;
        if let Some(worker) = &classifier_worker {
            worker.stop().await;
        }
        if let Some(worker) = &llm_worker {
            worker.stop().await;
        }
        if let Some(handle) = &housekeeping_handle {
            handle.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        if let Some(lock) = leader_lock {
            lock.release();
        }
        tracing::info!("Leader shutdown complete");
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}
