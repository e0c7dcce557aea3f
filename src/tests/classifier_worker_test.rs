// Classifier worker tests: catch-up classification, vector indexing, and
// duplicate re-checks for items that missed the intake path.

use std::sync::atomic::Ordering;

use super::common::{
    FakeClassifier, ItemSeed, build_classifier_worker, create_test_db, seed_channel,
    seed_named_channel,
};
use crate::models::{Priority, RetryPriority};
use crate::store::ItemRepository;

#[tokio::test]
async fn test_classifies_items_missed_at_intake() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;

    // Stored while the classifier was down: no pre_filter yet.
    let item_id = ItemSeed::new(channel_id, "r1").needs_llm(true).insert(&pool).await;

    let classifier = FakeClassifier::relevant(0.82);
    let worker = build_classifier_worker(&pool, classifier.clone());

    let processed = worker.classify_unclassified().await.unwrap();
    assert_eq!(processed, 1);
    assert_eq!(classifier.classify_calls.load(Ordering::Relaxed), 1);

    let items = ItemRepository::new(pool.clone());
    let item = items.get(item_id).await.unwrap().unwrap();
    assert!(item.metadata.pre_filter.is_some());
    assert_eq!(item.metadata.retry_priority, Some(RetryPriority::High));
    assert_eq!(item.priority, Priority::Medium);
    assert_eq!(item.priority_score, 70);
    assert!(item.needs_llm_processing);

    // Now visible to the LLM worker.
    assert_eq!(items.backlog_ids(10).await.unwrap(), vec![item_id]);

    // Nothing left to classify.
    assert_eq!(worker.classify_unclassified().await.unwrap(), 0);
}

#[tokio::test]
async fn test_certainly_irrelevant_items_skip_llm() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let item_id = ItemSeed::new(channel_id, "r1").needs_llm(true).insert(&pool).await;

    let classifier = FakeClassifier::relevant(0.10);
    let worker = build_classifier_worker(&pool, classifier);
    worker.classify_unclassified().await.unwrap();

    let items = ItemRepository::new(pool.clone());
    let item = items.get(item_id).await.unwrap().unwrap();
    assert_eq!(item.priority, Priority::None);
    assert_eq!(item.priority_score, 20);
    assert!(!item.needs_llm_processing);
    assert_eq!(item.metadata.retry_priority, Some(RetryPriority::Low));
    assert!(items.backlog_ids(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_indexes_unindexed_items() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let first = ItemSeed::new(channel_id, "r1").classified(0.8).insert(&pool).await;
    let second = ItemSeed::new(channel_id, "r2").classified(0.8).insert(&pool).await;

    let classifier = FakeClassifier::relevant(0.8);
    let worker = build_classifier_worker(&pool, classifier.clone());

    let indexed = worker.index_unindexed().await.unwrap();
    assert_eq!(indexed, 2);

    let items = ItemRepository::new(pool.clone());
    for id in [first, second] {
        let item = items.get(id).await.unwrap().unwrap();
        assert_eq!(item.metadata.vectordb_indexed, Some(true));
        assert!(item.metadata.vectordb_indexed_at.is_some());
    }

    let recorded = classifier.indexed.lock().await.clone();
    assert!(recorded.contains(&first.to_string()));
    assert!(recorded.contains(&second.to_string()));

    // Second pass finds nothing.
    assert_eq!(worker.index_unindexed().await.unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_recheck_links_to_oldest() {
    let pool = create_test_db().await;
    let (_, channel_a) = seed_named_channel(&pool, "Quelle A", "https://a.example/feed").await;
    let (_, channel_b) = seed_named_channel(&pool, "Quelle B", "https://b.example/feed").await;

    // A and B share a URL across channels; C is semantically close to both.
    let a = ItemSeed::new(channel_a, "a1")
        .url("https://example.org/u")
        .insert(&pool)
        .await;
    let b = ItemSeed::new(channel_b, "b1")
        .url("https://example.org/u")
        .insert(&pool)
        .await;
    let c = ItemSeed::new(channel_b, "c1")
        .title("Bundestag reformiert die Pflege")
        .insert(&pool)
        .await;

    let classifier = FakeClassifier::relevant(0.8);
    classifier.set_duplicates(vec![(b, 0.80), (a, 0.82)]).await;
    let worker = build_classifier_worker(&pool, classifier);

    let checked = worker.recheck_duplicates().await.unwrap();
    assert_eq!(checked, 3);

    let items = ItemRepository::new(pool.clone());

    // A is the cluster primary: it matched only itself-or-newer, no link.
    let item_a = items.get(a).await.unwrap().unwrap();
    assert_eq!(item_a.similar_to_id, None);
    assert_eq!(item_a.metadata.duplicate_checked, Some(true));

    // B linked by URL.
    let item_b = items.get(b).await.unwrap().unwrap();
    assert_eq!(item_b.similar_to_id, Some(a));
    assert_eq!(item_b.metadata.duplicate_method.as_deref(), Some("url_match"));

    // C linked semantically to the oldest candidate.
    let item_c = items.get(c).await.unwrap().unwrap();
    assert_eq!(item_c.similar_to_id, Some(a));
    assert_eq!(item_c.metadata.duplicate_score, Some(0.82));
}

#[tokio::test]
async fn test_newer_only_candidates_leave_item_unlinked() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let b = ItemSeed::new(channel_id, "b1").insert(&pool).await;

    // The only semantic match is a newer id: linking forward would break the
    // forest, so the item stays unlinked but is marked checked.
    let classifier = FakeClassifier::relevant(0.8);
    classifier.set_duplicates(vec![(b + 100, 0.9)]).await;
    let worker = build_classifier_worker(&pool, classifier);

    worker.recheck_duplicates().await.unwrap();

    let items = ItemRepository::new(pool.clone());
    let item = items.get(b).await.unwrap().unwrap();
    assert_eq!(item.similar_to_id, None);
    assert_eq!(item.metadata.duplicate_checked, Some(true));
    assert!(item.metadata.duplicate_score.is_none());
}

#[tokio::test]
async fn test_stale_vector_entries_are_cleared() {
    let pool = create_test_db().await;
    let (_, channel_id) = seed_channel(&pool).await;
    let stale = ItemSeed::new(channel_id, "gone").insert(&pool).await;
    let item = ItemSeed::new(channel_id, "kept").insert(&pool).await;

    // The stale row disappears from the store but lingers in the vector
    // index.
    sqlx::query("DELETE FROM items WHERE id = ?")
        .bind(stale)
        .execute(&pool)
        .await
        .unwrap();

    let classifier = FakeClassifier::relevant(0.8);
    classifier.set_duplicates(vec![(stale, 0.9)]).await;
    let worker = build_classifier_worker(&pool, classifier);

    worker.recheck_duplicates().await.unwrap();

    let items = ItemRepository::new(pool.clone());
    let kept = items.get(item).await.unwrap().unwrap();
    assert_eq!(kept.similar_to_id, None);
    assert!(kept.metadata.duplicate_score.is_none());
    assert_eq!(kept.metadata.duplicate_checked, Some(true));
}
