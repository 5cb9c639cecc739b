//! End-to-end capture flow: recorder -> backend -> reader.

use serde_json::{json, Map, Value};
use spyglass::config::{SpyglassConfig, StorageDriver};
use spyglass::entry::{EntryType, IncomingEntry};
use spyglass::recorder::{CapturePolicy, Recorder};
use spyglass::storage::{
    DatabaseEntriesRepository, EntriesRepository, Keyspace, QueryOptions,
    SortedSetEntriesRepository,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn content(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn query(sql: &str, tags: Vec<&str>) -> IncomingEntry {
    IncomingEntry::new(content(&[("sql", json!(sql))]))
        .tags(tags.into_iter().map(String::from))
}

async fn repositories() -> (TempDir, Vec<Arc<dyn EntriesRepository>>) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/telemetry.db", dir.path().display());
    let database = DatabaseEntriesRepository::new(&url).await.unwrap();
    let sorted_set =
        SortedSetEntriesRepository::new(Arc::new(Keyspace::new()), Duration::from_secs(3600));

    (dir, vec![Arc::new(database), Arc::new(sorted_set)])
}

/// The canonical unit-of-work scenario: three queries recorded, one
/// flush, then a tag-filtered listing.
#[tokio::test]
async fn test_one_unit_of_work_flushes_as_one_queryable_batch() {
    let (_dir, repositories) = repositories().await;

    for repository in repositories {
        let recorder = Recorder::new(Arc::new(CapturePolicy::new()));
        recorder.start_recording();

        recorder.record_query(query("select 1", vec!["users"]));
        recorder.record_query(query("select 2", vec!["orders"]));
        recorder.record_query(query("select 3", vec!["users", "orders"]));

        recorder.store(repository.as_ref()).await;

        let options = QueryOptions::default().with_tag("users").limit(10);
        let results = repository
            .get(Some(EntryType::Query), &options)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content["sql"], json!("select 3"));
        assert_eq!(results[1].content["sql"], json!("select 1"));

        // Every entry shares the flush's batch id.
        let batch = repository
            .get(None, &QueryOptions::for_batch(&results[0].batch_id))
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(results[0].batch_id, results[1].batch_id);

        // The queue is spent: a second flush stores nothing new.
        recorder.store(repository.as_ref()).await;
        let batch = repository
            .get(None, &QueryOptions::for_batch(&results[0].batch_id))
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
    }
}

#[tokio::test]
async fn test_nothing_is_captured_while_recording_is_off() {
    let (_dir, repositories) = repositories().await;

    for repository in repositories {
        let recorder = Recorder::new(Arc::new(CapturePolicy::new()));
        recorder.record_query(query("select 1", vec![]));
        recorder.store(repository.as_ref()).await;

        let results = repository
            .get(Some(EntryType::Query), &QueryOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}

#[tokio::test]
async fn test_filtered_entries_never_reach_storage() {
    let (_dir, repositories) = repositories().await;

    for repository in repositories {
        let policy = CapturePolicy::new()
            .filter(|entry| entry.content.get("sql") != Some(&json!("select secrets")));
        let recorder = Recorder::new(Arc::new(policy));
        recorder.start_recording();

        recorder.record_query(query("select 1", vec![]));
        recorder.record_query(query("select secrets", vec![]));
        recorder.store(repository.as_ref()).await;

        let results = repository
            .get(Some(EntryType::Query), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content["sql"], json!("select 1"));
    }
}

#[tokio::test]
async fn test_retention_limit_is_enforced_across_flushes() {
    let (_dir, repositories) = repositories().await;

    for repository in repositories {
        let policy = Arc::new(CapturePolicy::new().retention_limit(3));

        for i in 0..5 {
            let recorder = Recorder::new(policy.clone());
            recorder.start_recording();
            recorder.record_query(query(&format!("select {}", i), vec![]));
            recorder.store(repository.as_ref()).await;
        }

        let results = repository
            .get(Some(EntryType::Query), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content["sql"], json!("select 4"));
        assert_eq!(results[2].content["sql"], json!("select 2"));
    }
}

#[tokio::test]
async fn test_config_selected_backend_works_end_to_end() {
    let mut cfg = SpyglassConfig::default();
    cfg.storage.driver = StorageDriver::SortedSet;
    cfg.capture.hidden_content_keys = vec!["api_token".to_string()];

    let repository = cfg.build_repository().await.unwrap();
    let recorder = Recorder::new(Arc::new(cfg.capture_policy()));
    recorder.start_recording();

    recorder.record_request(IncomingEntry::new(content(&[
        ("uri", json!("/login")),
        ("password", json!("hunter2")),
        ("api_token", json!("tok_123")),
    ])));
    recorder.store(repository.as_ref()).await;

    let results = repository
        .get(Some(EntryType::Request), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].content["uri"], json!("/login"));
    assert_eq!(results[0].content["password"], json!("********"));
    assert_eq!(results[0].content["api_token"], json!("********"));
}
