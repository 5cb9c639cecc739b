//! Storage contract tests, run against both backends.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use spyglass::entry::{exception_family_hash, EntryType, EntryUpdate, IncomingEntry};
use spyglass::storage::{
    DatabaseEntriesRepository, EntriesRepository, Keyspace, QueryOptions,
    SortedSetEntriesRepository,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Backend {
    name: &'static str,
    repository: Arc<dyn EntriesRepository>,
    // Keeps the SQLite file alive for the test's duration.
    _dir: Option<TempDir>,
}

async fn backends() -> Vec<Backend> {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/telemetry.db", dir.path().display());
    let database = DatabaseEntriesRepository::new(&url).await.unwrap();

    let sorted_set =
        SortedSetEntriesRepository::new(Arc::new(Keyspace::new()), Duration::from_secs(3600));

    vec![
        Backend {
            name: "database",
            repository: Arc::new(database),
            _dir: Some(dir),
        },
        Backend {
            name: "sorted-set",
            repository: Arc::new(sorted_set),
            _dir: None,
        },
    ]
}

fn content(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn entry(entry_type: EntryType, batch: &str, tags: Vec<&str>, marker: i64) -> IncomingEntry {
    IncomingEntry::new(content(&[("marker", json!(marker))]))
        .entry_type(entry_type)
        .batch_id(batch)
        .tags(tags.into_iter().map(String::from))
}

#[tokio::test]
async fn test_round_trip_store_then_find() {
    for backend in backends().await {
        let stored = IncomingEntry::new(content(&[
            ("sql", json!("select * from users")),
            ("duration_ms", json!(12)),
        ]))
        .entry_type(EntryType::Query)
        .batch_id("batch-1")
        .tags(vec!["users:1".to_string(), "slow".to_string()]);
        let uuid = stored.uuid.clone();
        let created_at = stored.created_at;

        backend.repository.store(vec![stored]).await.unwrap();

        let found = backend.repository.find(&uuid).await.unwrap();
        assert_eq!(found.id, uuid, "backend {}", backend.name);
        assert_eq!(found.batch_id, "batch-1");
        assert_eq!(found.entry_type, EntryType::Query);
        assert_eq!(found.content["sql"], json!("select * from users"));
        assert_eq!(found.content["duration_ms"], json!(12));
        assert_eq!(found.tags, vec!["users:1", "slow"]);
        // Storage granularity may truncate sub-second precision.
        assert!((found.created_at - created_at).num_seconds().abs() <= 1);
    }
}

#[tokio::test]
async fn test_find_unknown_id_is_not_found() {
    for backend in backends().await {
        let error = backend.repository.find("no-such-entry").await.unwrap_err();
        assert!(
            matches!(error, spyglass::error::Error::NotFound(_)),
            "backend {}",
            backend.name
        );
    }
}

#[tokio::test]
async fn test_pagination_yields_every_entry_once() {
    for backend in backends().await {
        for marker in 0..25 {
            backend
                .repository
                .store(vec![entry(EntryType::Query, "b", vec![], marker)])
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<i64> = None;

        for _page in 0..10 {
            let mut options = QueryOptions::default().limit(10);
            if let Some(cursor) = cursor {
                options = options.before_sequence(cursor);
            }

            let page = backend
                .repository
                .get(Some(EntryType::Query), &options)
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }

            for result in &page {
                let sequence = result.sequence.expect("listing results carry a sequence");
                if let Some(last) = seen.last() {
                    assert!(sequence < *last, "backend {}", backend.name);
                }
                seen.push(sequence);
            }
            cursor = seen.last().copied();
        }

        assert_eq!(seen.len(), 25, "backend {}", backend.name);
    }
}

#[tokio::test]
async fn test_monitoring_is_idempotent() {
    for backend in backends().await {
        let tags = vec!["users:1".to_string(), "deploys".to_string()];
        backend.repository.monitor(&tags).await.unwrap();
        backend.repository.monitor(&tags).await.unwrap();

        let mut monitored = backend.repository.monitoring().await.unwrap();
        monitored.sort();
        assert_eq!(monitored, vec!["deploys", "users:1"], "backend {}", backend.name);

        assert!(backend
            .repository
            .is_monitoring(&["users:1".to_string()])
            .await
            .unwrap());
        assert!(!backend
            .repository
            .is_monitoring(&["orders:9".to_string()])
            .await
            .unwrap());

        backend
            .repository
            .stop_monitoring(&["users:1".to_string()])
            .await
            .unwrap();
        let monitored = backend.repository.monitoring().await.unwrap();
        assert_eq!(monitored, vec!["deploys"], "backend {}", backend.name);
    }
}

#[tokio::test]
async fn test_recurring_exceptions_collapse_on_the_index() {
    for backend in backends().await {
        let family = exception_family_hash("DivisionByZero", "src/math.rs", 17);
        let mut uuids = Vec::new();

        for attempt in 0..3 {
            let exception = IncomingEntry::new(content(&[
                ("class", json!("DivisionByZero")),
                ("message", json!(format!("attempt {}", attempt))),
            ]))
            .entry_type(EntryType::Exception)
            .batch_id("b")
            .family_hash(family.clone());
            uuids.push(exception.uuid.clone());

            backend.repository.store(vec![exception]).await.unwrap();
        }

        let listed = backend
            .repository
            .get(Some(EntryType::Exception), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1, "backend {}", backend.name);
        assert_eq!(listed[0].id, uuids[2]);
        assert_eq!(listed[0].content["occurrences"], json!(2));

        // Superseded occurrences stay queryable by id.
        let first = backend.repository.find(&uuids[0]).await.unwrap();
        assert_eq!(first.content["message"], json!("attempt 0"));
    }
}

#[tokio::test]
async fn test_prune_entries_bounds_retention_per_type() {
    for backend in backends().await {
        for marker in 0..6 {
            backend
                .repository
                .store(vec![entry(EntryType::Request, "b", vec![], marker)])
                .await
                .unwrap();
        }
        backend
            .repository
            .store(vec![entry(EntryType::Query, "b", vec![], 99)])
            .await
            .unwrap();

        let removed = backend
            .repository
            .prune_entries(EntryType::Request, 2)
            .await
            .unwrap();
        assert_eq!(removed, 4, "backend {}", backend.name);

        let requests = backend
            .repository
            .get(Some(EntryType::Request), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].content["marker"], json!(5));
        assert_eq!(requests[1].content["marker"], json!(4));

        // Other types are untouched.
        let queries = backend
            .repository
            .get(Some(EntryType::Query), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(queries.len(), 1);
    }
}

#[tokio::test]
async fn test_batch_listing_returns_every_type() {
    for backend in backends().await {
        backend
            .repository
            .store(vec![
                entry(EntryType::Request, "unit-1", vec![], 0),
                entry(EntryType::Query, "unit-1", vec![], 1),
                entry(EntryType::Log, "unit-1", vec![], 2),
                entry(EntryType::Query, "unit-2", vec![], 3),
            ])
            .await
            .unwrap();

        let batch = backend
            .repository
            .get(None, &QueryOptions::for_batch("unit-1"))
            .await
            .unwrap();

        assert_eq!(batch.len(), 3, "backend {}", backend.name);
        let markers: Vec<&Value> = batch.iter().map(|r| &r.content["marker"]).collect();
        assert_eq!(markers, vec![&json!(0), &json!(1), &json!(2)]);
    }
}

#[tokio::test]
async fn test_tagged_listing_intersects_type_and_tag() {
    for backend in backends().await {
        backend
            .repository
            .store(vec![
                entry(EntryType::Query, "unit", vec!["users"], 0),
                entry(EntryType::Query, "unit", vec!["orders"], 1),
                entry(EntryType::Query, "unit", vec!["users", "orders"], 2),
            ])
            .await
            .unwrap();

        let options = QueryOptions::default().with_tag("users").limit(10);
        let results = backend
            .repository
            .get(Some(EntryType::Query), &options)
            .await
            .unwrap();

        assert_eq!(results.len(), 2, "backend {}", backend.name);
        assert_eq!(results[0].content["marker"], json!(2));
        assert_eq!(results[1].content["marker"], json!(0));
    }
}

#[tokio::test]
async fn test_update_merges_deferred_changes() {
    for backend in backends().await {
        let job = IncomingEntry::new(content(&[
            ("name", json!("SendInvoice")),
            ("status", json!("pending")),
        ]))
        .entry_type(EntryType::Job)
        .batch_id("b");
        let uuid = job.uuid.clone();

        backend.repository.store(vec![job]).await.unwrap();
        backend
            .repository
            .update(vec![EntryUpdate::new(uuid.clone(), EntryType::Job)
                .change("status", json!("processed"))
                .change("updated_batch_id", json!("b2"))])
            .await
            .unwrap();

        let found = backend.repository.find(&uuid).await.unwrap();
        assert_eq!(found.content["name"], json!("SendInvoice"));
        assert_eq!(found.content["status"], json!("processed"));
        assert_eq!(found.content["updated_batch_id"], json!("b2"));

        // Updates to missing entries are skipped, not errors.
        backend
            .repository
            .update(vec![
                EntryUpdate::new("missing", EntryType::Job).change("status", json!("lost"))
            ])
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_malformed_batch_query_degrades_to_batch_listing() {
    for backend in backends().await {
        backend
            .repository
            .store(vec![entry(EntryType::Query, "unit-1", vec!["users"], 0)])
            .await
            .unwrap();

        // tag composes with neither batch listing; it is dropped.
        let options = QueryOptions::for_batch("unit-1").with_tag("orders");
        let results = backend.repository.get(None, &options).await.unwrap();
        assert_eq!(results.len(), 1, "backend {}", backend.name);
    }
}

#[tokio::test]
async fn test_database_prune_removes_aged_entries() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/telemetry.db", dir.path().display());
    let repository = DatabaseEntriesRepository::new(&url).await.unwrap();

    let mut aged = entry(EntryType::Query, "b", vec![], 0);
    aged.created_at = Utc::now() - ChronoDuration::days(3);
    let fresh = entry(EntryType::Query, "b", vec![], 1);

    repository.store(vec![aged, fresh]).await.unwrap();

    let removed = repository
        .prune(Utc::now() - ChronoDuration::days(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let remaining = repository
        .get(Some(EntryType::Query), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].content["marker"], json!(1));
}

#[tokio::test]
async fn test_sorted_set_prune_normalizes_cutoff_to_day_start() {
    let repository =
        SortedSetEntriesRepository::new(Arc::new(Keyspace::new()), Duration::from_secs(3600));

    repository
        .store(vec![
            entry(EntryType::Query, "b", vec!["users"], 0),
            entry(EntryType::Query, "b", vec![], 1),
        ])
        .await
        .unwrap();

    // Entries were written today, so a cutoff of "now" rounds back to
    // midnight and removes nothing.
    let removed = repository.prune(Utc::now()).await.unwrap();
    assert_eq!(removed, 0);

    let removed = repository
        .prune(Utc::now() + ChronoDuration::days(1))
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let remaining = repository
        .get(Some(EntryType::Query), &QueryOptions::default())
        .await
        .unwrap();
    assert!(remaining.is_empty());
}
