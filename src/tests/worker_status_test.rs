// Command channel and worker state/stats rows.

use super::common::create_test_db;
use crate::models::{LlmWorkerStats, WORKER_LLM, WORKER_SCHEDULER, WorkerAction};
use crate::services::WorkerStatusRepository;

#[tokio::test]
async fn test_command_roundtrip_clears_on_consumption() {
    let pool = create_test_db().await;
    let status = WorkerStatusRepository::new(pool.clone());

    assert_eq!(status.read_and_clear_command(WORKER_LLM).await.unwrap(), None);

    status.issue_command(WORKER_LLM, WorkerAction::Pause).await.unwrap();
    assert_eq!(
        status.read_and_clear_command(WORKER_LLM).await.unwrap(),
        Some(WorkerAction::Pause)
    );

    // Consumed: the row is gone.
    assert_eq!(status.read_and_clear_command(WORKER_LLM).await.unwrap(), None);
}

#[tokio::test]
async fn test_newer_command_replaces_pending_one() {
    let pool = create_test_db().await;
    let status = WorkerStatusRepository::new(pool.clone());

    status.issue_command(WORKER_LLM, WorkerAction::Pause).await.unwrap();
    status.issue_command(WORKER_LLM, WorkerAction::Stop).await.unwrap();

    assert_eq!(
        status.read_and_clear_command(WORKER_LLM).await.unwrap(),
        Some(WorkerAction::Stop)
    );
}

#[tokio::test]
async fn test_state_and_stats_rows() {
    let pool = create_test_db().await;
    let status = WorkerStatusRepository::new(pool.clone());

    status.write_state(WORKER_LLM, true, false, false).await.unwrap();
    status.write_state(WORKER_SCHEDULER, true, true, false).await.unwrap();
    status.write_state(WORKER_LLM, true, true, false).await.unwrap();

    let states = status.all_states().await.unwrap();
    assert_eq!(states.len(), 2);
    let llm_state = states.iter().find(|s| s.worker == WORKER_LLM).unwrap();
    assert!(llm_state.running);
    assert!(llm_state.paused);

    let stats = LlmWorkerStats { fresh_processed: 3, backlog_processed: 7, ..Default::default() };
    status.write_stats(WORKER_LLM, &stats).await.unwrap();

    let blob = status.stats_blob(WORKER_LLM).await.unwrap().unwrap();
    assert_eq!(blob["fresh_processed"], 3);
    assert_eq!(blob["backlog_processed"], 7);
}

#[tokio::test]
async fn test_poll_interval_setting_override() {
    let pool = create_test_db().await;
    let status = WorkerStatusRepository::new(pool.clone());

    assert_eq!(status.poll_interval_secs(5).await, 5);

    let settings = crate::store::SettingsRepository::new(pool.clone());
    settings
        .set(
            crate::models::SETTING_WORKER_POLL_INTERVAL,
            &serde_json::json!(12),
            Some("poll cadence override"),
        )
        .await
        .unwrap();

    assert_eq!(status.poll_interval_secs(5).await, 12);
}
