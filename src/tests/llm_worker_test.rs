// LLM worker tests: queue discipline, the pre-filter gate, priority mapping
// on stored items, and failure isolation.

use std::sync::atomic::Ordering;

use super::common::{
    FakeLlmProvider, ItemSeed, build_llm_worker, create_test_db, seed_channel,
};
use crate::models::{EVENT_LLM_PROCESSED, Priority, RetryPriority};
use crate::store::{EventRepository, ItemRepository};

const S1_RESPONSE: &str = r#"{
  "summary": "Der Bundestag hat die Pflegereform beschlossen.",
  "detailed_analysis": "Die Reform umfasst höhere Zuschüsse und neue Personalschlüssel.",
  "relevant": true,
  "relevance_score": 0.9,
  "priority": "high",
  "assigned_aks": ["AK3"],
  "tags": ["pflege"],
  "reasoning": "Direkter Bezug zur Altenpflege"
}"#;

#[tokio::test]
async fn test_happy_llm_processing() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let item_id = ItemSeed::new(channel_id, "r1")
        .classified(0.82)
        .priority(Priority::Medium, 70)
        .needs_llm(true)
        .insert(&pool)
        .await;

    let provider = FakeLlmProvider::returning(S1_RESPONSE);
    let (worker, _tx) = build_llm_worker(&pool, provider.clone());

    let processed = worker.process_items(&[item_id], true).await.unwrap();
    assert_eq!(processed, 1);
    assert_eq!(provider.calls.load(Ordering::Relaxed), 1);

    let items = ItemRepository::new(pool.clone());
    let item = items.get(item_id).await.unwrap().unwrap();

    assert_eq!(item.priority, Priority::High);
    assert!(item.priority_score >= 90);
    assert_eq!(item.assigned_aks, vec!["AK3"]);
    assert!(!item.needs_llm_processing);
    assert_eq!(
        item.summary.as_deref(),
        Some("Der Bundestag hat die Pflegereform beschlossen.")
    );
    assert!(item.detailed_analysis.is_some());

    let analysis = item.metadata.llm_analysis.expect("llm_analysis must be stored");
    assert_eq!(analysis.priority_suggestion.as_deref(), Some("high"));
    assert_eq!(analysis.assigned_aks, vec!["AK3"]);
    assert_eq!(analysis.source, "llm_worker");

    // Classifier-owned metadata is untouched by the overlay.
    assert!(item.metadata.pre_filter.is_some());

    let events = EventRepository::new(pool.clone());
    let item_events = events.for_item(item_id).await.unwrap();
    assert!(item_events.iter().any(|e| e.event_type == EVENT_LLM_PROCESSED));
}

#[tokio::test]
async fn test_prefilter_gate() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    // Unclassified: must never reach the LLM, even via the fresh path.
    let item_id = ItemSeed::new(channel_id, "r1").needs_llm(true).insert(&pool).await;

    let provider = FakeLlmProvider::returning(S1_RESPONSE);
    let (worker, _tx) = build_llm_worker(&pool, provider.clone());

    let items = ItemRepository::new(pool.clone());
    assert!(items.backlog_ids(10).await.unwrap().is_empty());

    let processed = worker.process_items(&[item_id], true).await.unwrap();
    assert_eq!(processed, 0);
    assert_eq!(provider.calls.load(Ordering::Relaxed), 0);

    let item = items.get(item_id).await.unwrap().unwrap();
    assert!(item.needs_llm_processing, "item must stay queued for the classifier");
}

#[tokio::test]
async fn test_backlog_ordering_and_low_exclusion() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;

    // Oldest first by insertion, but retry priority dominates the order.
    let low = ItemSeed::new(channel_id, "low")
        .classified(0.1)
        .priority(Priority::None, 20)
        .needs_llm(true)
        .insert(&pool)
        .await;
    let edge = ItemSeed::new(channel_id, "edge")
        .classified(0.3)
        .priority(Priority::Low, 55)
        .needs_llm(true)
        .insert(&pool)
        .await;
    let high = ItemSeed::new(channel_id, "high")
        .classified(0.8)
        .priority(Priority::Medium, 70)
        .needs_llm(true)
        .insert(&pool)
        .await;

    let items = ItemRepository::new(pool.clone());
    let backlog = items.backlog_ids(10).await.unwrap();

    // retry_priority=high before edge_case; low stays out entirely.
    assert_eq!(backlog, vec![high, edge]);
    assert!(!backlog.contains(&low));

    // A low-retry item that is relevance-bearing without a working group is
    // picked up by the relaxed branch.
    let relevant_no_ak = ItemSeed::new(channel_id, "no-ak")
        .classified(0.1)
        .priority(Priority::Medium, 70)
        .needs_llm(true)
        .insert(&pool)
        .await;
    let backlog = items.backlog_ids(10).await.unwrap();
    assert!(backlog.contains(&relevant_no_ak));
}

#[tokio::test]
async fn test_fresh_preempts_backlog() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let backlog_item = ItemSeed::new(channel_id, "b1")
        .classified(0.8)
        .priority(Priority::Medium, 70)
        .needs_llm(true)
        .insert(&pool)
        .await;
    let fresh_item = ItemSeed::new(channel_id, "f1")
        .classified(0.8)
        .priority(Priority::Medium, 70)
        .needs_llm(true)
        .insert(&pool)
        .await;

    let provider = FakeLlmProvider::returning(S1_RESPONSE);
    let (worker, tx) = build_llm_worker(&pool, provider.clone());

    // A fresh item is waiting: backlog processing must yield before touching
    // a single item.
    tx.send(fresh_item).await.unwrap();
    let processed = worker.process_items(&[backlog_item], false).await.unwrap();
    assert_eq!(processed, 0);
    assert_eq!(provider.calls.load(Ordering::Relaxed), 0);

    let items = ItemRepository::new(pool.clone());
    assert!(items.get(backlog_item).await.unwrap().unwrap().needs_llm_processing);

    // The fresh batch then drains the queue.
    let fresh_processed = worker.process_fresh_batch().await.unwrap();
    assert_eq!(fresh_processed, 1);
    assert!(!items.get(fresh_item).await.unwrap().unwrap().needs_llm_processing);
}

#[tokio::test]
async fn test_relevant_false_overrides_priority() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let item_id = ItemSeed::new(channel_id, "r1")
        .classified(0.6)
        .priority(Priority::Medium, 70)
        .needs_llm(true)
        .insert(&pool)
        .await;

    // Contradictory output: textual priority set, but relevant=false wins.
    let provider = FakeLlmProvider::returning(
        r#"{"summary": null, "relevant": false, "relevance_score": 0.1, "priority": "high", "assigned_aks": []}"#,
    );
    let (worker, _tx) = build_llm_worker(&pool, provider);

    worker.process_items(&[item_id], true).await.unwrap();

    let items = ItemRepository::new(pool.clone());
    let item = items.get(item_id).await.unwrap().unwrap();
    assert_eq!(item.priority, Priority::None);
    assert!(item.priority_score <= 20);
    assert!(!item.needs_llm_processing);
}

#[tokio::test]
async fn test_classifier_ak_used_as_fallback() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let item_id = ItemSeed::new(channel_id, "r1")
        .classified(0.8)
        .priority(Priority::Medium, 70)
        .needs_llm(true)
        .insert(&pool)
        .await;

    // LLM assigns no working group; the classifier suggested AK3.
    let provider = FakeLlmProvider::returning(
        r#"{"summary": "S", "relevant": true, "relevance_score": 0.7, "priority": "medium", "assigned_aks": []}"#,
    );
    let (worker, _tx) = build_llm_worker(&pool, provider);

    worker.process_items(&[item_id], true).await.unwrap();

    let items = ItemRepository::new(pool.clone());
    let item = items.get(item_id).await.unwrap().unwrap();
    assert_eq!(item.assigned_aks, vec!["AK3"]);
}

#[tokio::test]
async fn test_provider_failure_keeps_item_queued() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let failing = ItemSeed::new(channel_id, "r1")
        .classified(0.8)
        .priority(Priority::Medium, 70)
        .needs_llm(true)
        .insert(&pool)
        .await;
    let healthy = ItemSeed::new(channel_id, "r2")
        .classified(0.8)
        .priority(Priority::Medium, 70)
        .needs_llm(true)
        .insert(&pool)
        .await;

    let provider = FakeLlmProvider::returning(S1_RESPONSE);
    *provider.response.lock().await = Err("connection reset".to_string());
    let (worker, _tx) = build_llm_worker(&pool, provider.clone());

    // Both fail; neither failure affects the other, and both stay queued.
    let processed = worker.process_items(&[failing, healthy], false).await.unwrap();
    assert_eq!(processed, 0);
    assert_eq!(worker.stats_snapshot().await.errors, 2);

    let items = ItemRepository::new(pool.clone());
    assert!(items.get(failing).await.unwrap().unwrap().needs_llm_processing);
    assert!(items.get(healthy).await.unwrap().unwrap().needs_llm_processing);

    // Provider recovers: the same items process on the next pass.
    *provider.response.lock().await = Ok(S1_RESPONSE.to_string());
    let processed = worker.process_items(&[failing, healthy], false).await.unwrap();
    assert_eq!(processed, 2);
}

#[tokio::test]
async fn test_retry_priority_metadata_preserved() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let item_id = ItemSeed::new(channel_id, "r1")
        .classified(0.82)
        .priority(Priority::Medium, 70)
        .needs_llm(true)
        .insert(&pool)
        .await;

    let provider = FakeLlmProvider::returning(S1_RESPONSE);
    let (worker, _tx) = build_llm_worker(&pool, provider);
    worker.process_items(&[item_id], false).await.unwrap();

    // The LLM overlay writes only its own subtree.
    let items = ItemRepository::new(pool.clone());
    let item = items.get(item_id).await.unwrap().unwrap();
    assert_eq!(item.metadata.retry_priority, Some(RetryPriority::High));
    assert!(item.metadata.pre_filter.is_some());
    assert!(item.metadata.llm_analysis.is_some());
}
