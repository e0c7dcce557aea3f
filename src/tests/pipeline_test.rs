// Ingestion pipeline tests: intake dedupe, classification, duplicate
// detection, and the fresh-queue handoff.

use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::mpsc;

use super::common::{FakeClassifier, create_test_db, seed_channel, seed_named_channel};
use crate::connectors::RawItem;
use crate::models::{EVENT_FETCHED, Priority, RetryPriority};
use crate::services::IngestPipeline;
use crate::store::{ChannelRepository, EventRepository, ItemRepository};

fn raw_item(external_id: &str, title: &str, url: &str) -> RawItem {
    RawItem {
        external_id: external_id.to_string(),
        title: title.to_string(),
        content: format!("Inhalt zu {}", title),
        url: url.to_string(),
        author: None,
        published_at: Some(Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()),
        metadata: json!({}),
    }
}

fn build_pipeline(
    pool: &sqlx::SqlitePool,
    classifier: std::sync::Arc<FakeClassifier>,
) -> (IngestPipeline, mpsc::Receiver<i64>) {
    let (tx, rx) = mpsc::channel(16);
    let pipeline = IngestPipeline::new(
        pool.clone(),
        classifier,
        tx,
        0.75,
        vec!["Pressemitteilung:".to_string()],
    );
    (pipeline, rx)
}

#[tokio::test]
async fn test_happy_ingestion() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let channels = ChannelRepository::new(pool.clone());
    let channel = channels.get_with_source(channel_id).await.unwrap().unwrap();

    let classifier = FakeClassifier::relevant(0.82);
    let (pipeline, mut fresh_rx) = build_pipeline(&pool, classifier.clone());

    let inserted = pipeline
        .ingest(
            &channel,
            vec![raw_item(
                "r1",
                "Bundestag beschließt Reform der Pflege",
                "https://example.org/a",
            )],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let items = ItemRepository::new(pool.clone());
    let item_id = fresh_rx.try_recv().expect("item should be on the fresh queue");
    let item = items.get(item_id).await.unwrap().unwrap();

    assert_eq!(item.priority, Priority::Medium);
    assert_eq!(item.priority_score, 70);
    assert!(item.needs_llm_processing);

    let pre_filter = item.metadata.pre_filter.expect("pre_filter must be stored");
    assert_eq!(pre_filter.relevance_confidence, 0.82);
    assert_eq!(pre_filter.ak_suggestion.as_deref(), Some("AK3"));
    assert_eq!(item.metadata.retry_priority, Some(RetryPriority::High));
    assert_eq!(item.metadata.vectordb_indexed, Some(true));
    assert_eq!(item.metadata.duplicate_checked, Some(true));

    // Indexed under its own id.
    assert_eq!(*classifier.indexed.lock().await, vec![item_id.to_string()]);

    // Fetch audit event written in the same transaction as the item.
    let events = EventRepository::new(pool.clone());
    let item_events = events.for_item(item_id).await.unwrap();
    assert!(item_events.iter().any(|e| e.event_type == EVENT_FETCHED));
}

#[tokio::test]
async fn test_classifier_offline_at_intake() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let channels = ChannelRepository::new(pool.clone());
    let channel = channels.get_with_source(channel_id).await.unwrap().unwrap();

    let classifier = FakeClassifier::offline();
    let (pipeline, mut fresh_rx) = build_pipeline(&pool, classifier);

    let inserted = pipeline
        .ingest(
            &channel,
            vec![raw_item("r1", "Bundestag beschließt Reform", "https://example.org/a")],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    // Stored unclassified: the classifier worker catches up later.
    let items = ItemRepository::new(pool.clone());
    let all_backlog = items.backlog_ids(10).await.unwrap();
    assert!(all_backlog.is_empty(), "unclassified items must not reach the LLM backlog");

    let unclassified = items.unclassified(10).await.unwrap();
    assert_eq!(unclassified.len(), 1);
    let item = &unclassified[0].item;
    assert!(item.metadata.pre_filter.is_none());
    assert!(item.needs_llm_processing);
    assert!(item.metadata.duplicate_checked.is_none());
    assert!(item.metadata.vectordb_indexed.is_none());

    // Never enqueued while unclassified.
    assert!(fresh_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_irrelevant_fast_path() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let channels = ChannelRepository::new(pool.clone());
    let channel = channels.get_with_source(channel_id).await.unwrap().unwrap();

    let classifier = FakeClassifier::relevant(0.10);
    let (pipeline, mut fresh_rx) = build_pipeline(&pool, classifier);

    pipeline
        .ingest(&channel, vec![raw_item("r1", "Wetterbericht", "https://example.org/w")])
        .await
        .unwrap();

    let items = ItemRepository::new(pool.clone());
    let backlog = items.backlog_ids(10).await.unwrap();
    assert!(backlog.is_empty());

    let item = items.get(1).await.unwrap().unwrap();
    assert_eq!(item.priority, Priority::None);
    assert_eq!(item.priority_score, 20);
    assert!(!item.needs_llm_processing);
    assert_eq!(item.metadata.retry_priority, Some(RetryPriority::Low));

    // Never enters the fresh queue.
    assert!(fresh_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_idempotent_intake() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let channels = ChannelRepository::new(pool.clone());
    let channel = channels.get_with_source(channel_id).await.unwrap().unwrap();

    let classifier = FakeClassifier::relevant(0.82);
    let (pipeline, _fresh_rx) = build_pipeline(&pool, classifier);

    let item = raw_item("r1", "Reform der Pflege", "https://example.org/a");
    let first = pipeline.ingest(&channel, vec![item.clone()]).await.unwrap();
    let second = pipeline.ingest(&channel, vec![item.clone()]).await.unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 0);

    // Same content under a new external id is still an intake duplicate.
    let mut renamed = item.clone();
    renamed.external_id = "r1-copy".to_string();
    let third = pipeline.ingest(&channel, vec![renamed]).await.unwrap();
    assert_eq!(third, 0);

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_url_duplicate_cluster_at_intake() {
    let pool = create_test_db().await;
    let (_, channel_a) = seed_named_channel(&pool, "Quelle A", "https://a.example/feed").await;
    let (_, channel_b) = seed_named_channel(&pool, "Quelle B", "https://b.example/feed").await;
    let channels = ChannelRepository::new(pool.clone());

    let classifier = FakeClassifier::relevant(0.82);
    let (pipeline, _fresh_rx) = build_pipeline(&pool, classifier.clone());

    // A arrives first on channel A.
    let chan_a = channels.get_with_source(channel_a).await.unwrap().unwrap();
    pipeline
        .ingest(&chan_a, vec![raw_item("a1", "Reform der Pflege", "https://example.org/u")])
        .await
        .unwrap();

    // B: same URL, different channel.
    let chan_b = channels.get_with_source(channel_b).await.unwrap().unwrap();
    pipeline
        .ingest(&chan_b, vec![raw_item("b1", "Pflegereform beschlossen", "https://example.org/u")])
        .await
        .unwrap();

    let items = ItemRepository::new(pool.clone());
    let item_b = items.get(2).await.unwrap().unwrap();
    assert_eq!(item_b.similar_to_id, Some(1));
    assert_eq!(item_b.metadata.duplicate_method.as_deref(), Some("url_match"));

    // C: semantically similar to both; the oldest (smallest id) wins.
    classifier.set_duplicates(vec![(2, 0.80), (1, 0.82)]).await;
    pipeline
        .ingest(
            &chan_b,
            vec![raw_item("c1", "Bundestag reformiert die Pflege", "https://example.org/c")],
        )
        .await
        .unwrap();

    let item_c = items.get(3).await.unwrap().unwrap();
    assert_eq!(item_c.similar_to_id, Some(1));
    assert_eq!(item_c.metadata.duplicate_score, Some(0.82));
    assert!(item_c.metadata.duplicate_method.is_none());

    // Forest invariant: every link points to an older, existing item.
    let links: Vec<(i64, Option<i64>)> =
        sqlx::query_as("SELECT id, similar_to_id FROM items ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
    for (id, similar_to) in links {
        if let Some(target) = similar_to {
            assert!(target < id, "similar_to_id must point backwards");
            assert!(
                ItemRepository::new(pool.clone()).get(target).await.unwrap().is_some(),
                "similar_to_id must reference an existing item"
            );
        }
    }
}

#[tokio::test]
async fn test_stakeholder_items_never_filtered_out() {
    let pool = create_test_db().await;
    let channels = ChannelRepository::new(pool.clone());
    let source = channels.create_source("Mitgliedsverband", None, true).await.unwrap();
    let channel = channels
        .create_channel(
            source.id,
            None,
            crate::models::ConnectorType::Rss,
            &json!({"url": "https://member.example/feed"}),
            30,
        )
        .await
        .unwrap();
    let channel = channels.get_with_source(channel.id).await.unwrap().unwrap();

    // Certainly irrelevant per the classifier, but the source is a
    // stakeholder: it stays visible and still reaches the LLM.
    let classifier = FakeClassifier::relevant(0.05);
    let (pipeline, _fresh_rx) = build_pipeline(&pool, classifier);
    pipeline
        .ingest(&channel, vec![raw_item("m1", "Vereinsnachricht", "https://member.example/1")])
        .await
        .unwrap();

    let items = ItemRepository::new(pool.clone());
    let item = items.get(1).await.unwrap().unwrap();
    assert_eq!(item.priority, Priority::Low);
    assert!(item.needs_llm_processing);
}
