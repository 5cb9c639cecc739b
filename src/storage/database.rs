//! Relational storage backend over SQLite
//!
//! Entries live in an `entries` table whose auto-incrementing row id is the
//! pagination sequence, with a flattened `entry_tags` relation for tag
//! filtering and a `monitored_tags` table for the monitoring registry.
//! Batches are written inside one transaction so a flush becomes visible to
//! readers all at once.

use crate::entry::{EntryResult, EntryType, EntryUpdate, IncomingEntry};
use crate::error::{Error, Result};
use crate::storage::{EntriesRepository, QueryOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

/// Relational entries repository.
///
/// # Example
///
/// ```ignore
/// let repository = DatabaseEntriesRepository::new("sqlite:./data/telemetry.db").await?;
/// let page = repository.get(Some(EntryType::Request), &QueryOptions::default()).await?;
/// ```
pub struct DatabaseEntriesRepository {
    pool: SqlitePool,

    /// Monitored tags, cached for the current unit of work. Invalidated by
    /// `terminate`.
    monitored_tags: Mutex<Option<HashSet<String>>>,
}

impl DatabaseEntriesRepository {
    /// Connect and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("cache_size", "-64000")
            .pragma("temp_store", "memory")
            .pragma("synchronous", "NORMAL");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Storage(Box::new(e)))?;

        tracing::debug!(database_url, "Telemetry database ready");

        Ok(Self {
            pool,
            monitored_tags: Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fetch and attach the tags for a page of entries in one query.
    async fn load_tags(&self, uuids: &[String]) -> Result<HashMap<String, Vec<String>>> {
        if uuids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; uuids.len()].join(", ");
        let sql = format!(
            "SELECT entry_uuid, tag FROM entry_tags WHERE entry_uuid IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for uuid in uuids {
            query = query.bind(uuid);
        }

        let mut tags: HashMap<String, Vec<String>> = HashMap::new();
        for row in query.fetch_all(&self.pool).await? {
            tags.entry(row.get("entry_uuid"))
                .or_default()
                .push(row.get("tag"));
        }
        Ok(tags)
    }
}

fn row_to_result(row: &sqlx::sqlite::SqliteRow, tags: Vec<String>) -> Result<EntryResult> {
    let type_name: String = row.get("type");
    let entry_type = EntryType::parse(&type_name).ok_or_else(|| {
        Error::MalformedQuery(format!("unknown entry type in storage: {}", type_name))
    })?;
    let content: String = row.get("content");

    Ok(EntryResult {
        id: row.get("uuid"),
        sequence: Some(row.get::<i64, _>("sequence")),
        batch_id: row.get("batch_id"),
        entry_type,
        content: serde_json::from_str(&content)?,
        tags,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    })
}

async fn insert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &IncomingEntry,
    entry_type: EntryType,
    content: &Map<String, Value>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO entries (uuid, batch_id, type, family_hash, should_display_on_index, content, created_at)
         VALUES (?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&entry.uuid)
    .bind(entry.batch_id.as_deref().unwrap_or_default())
    .bind(entry_type.as_str())
    .bind(&entry.family_hash)
    .bind(serde_json::to_string(content)?)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await?;

    for tag in &entry.tags {
        sqlx::query("INSERT INTO entry_tags (entry_uuid, tag) VALUES (?, ?)")
            .bind(&entry.uuid)
            .bind(tag)
            .execute(&mut **tx)
            .await?;
    }

    Ok(())
}

/// Family deduplication: supersede the stored occurrences of this family
/// and stamp the new entry with how many came before it.
async fn store_exception(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &IncomingEntry,
) -> Result<()> {
    let mut content = entry.content.clone();

    if let Some(family_hash) = &entry.family_hash {
        let occurrences: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entries WHERE type = ? AND family_hash = ?",
        )
        .bind(EntryType::Exception.as_str())
        .bind(family_hash)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query(
            "UPDATE entries SET should_display_on_index = 0 WHERE type = ? AND family_hash = ?",
        )
        .bind(EntryType::Exception.as_str())
        .bind(family_hash)
        .execute(&mut **tx)
        .await?;

        content.insert("occurrences".to_string(), Value::from(occurrences));
    }

    insert_entry(tx, entry, EntryType::Exception, &content).await
}

#[async_trait]
impl EntriesRepository for DatabaseEntriesRepository {
    async fn find(&self, id: &str) -> Result<EntryResult> {
        let row = sqlx::query(
            "SELECT sequence, uuid, batch_id, type, content, created_at
             FROM entries WHERE uuid = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let tags = sqlx::query("SELECT tag FROM entry_tags WHERE entry_uuid = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.get("tag"))
            .collect();

        row_to_result(&row, tags)
    }

    async fn get(
        &self,
        entry_type: Option<EntryType>,
        options: &QueryOptions,
    ) -> Result<Vec<EntryResult>> {
        let mut options = options.normalized();
        if entry_type.is_none() && options.batch_id.is_none() && options.tag.is_some() {
            tracing::warn!("Tag filtering requires an entry type, falling back to unfiltered listing");
            options.tag = None;
        }

        let mut sql = String::from(
            "SELECT sequence, uuid, batch_id, type, content, created_at FROM entries WHERE 1 = 1",
        );

        if entry_type.is_some() {
            sql.push_str(" AND type = ?");
        }
        if options.batch_id.is_some() {
            sql.push_str(" AND batch_id = ?");
        } else {
            // Index views hide superseded exception occurrences.
            sql.push_str(" AND should_display_on_index = 1");
        }
        if options.tag.is_some() {
            sql.push_str(" AND uuid IN (SELECT entry_uuid FROM entry_tags WHERE tag = ?)");
        }
        if options.before_sequence.is_some() {
            sql.push_str(" AND sequence < ?");
        }
        if options.batch_id.is_some() {
            sql.push_str(" ORDER BY sequence ASC");
        } else {
            sql.push_str(" ORDER BY sequence DESC LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(entry_type) = entry_type {
            query = query.bind(entry_type.as_str());
        }
        if let Some(batch_id) = &options.batch_id {
            query = query.bind(batch_id);
        }
        if let Some(tag) = &options.tag {
            query = query.bind(tag);
        }
        if let Some(before) = options.before_sequence {
            query = query.bind(before);
        }
        if options.batch_id.is_none() {
            query = query.bind(options.limit);
        }

        let rows = query.fetch_all(&self.pool).await?;

        let uuids: Vec<String> = rows.iter().map(|row| row.get("uuid")).collect();
        let mut tags = self.load_tags(&uuids).await?;

        rows.iter()
            .map(|row| {
                let uuid: String = row.get("uuid");
                row_to_result(row, tags.remove(&uuid).unwrap_or_default())
            })
            .collect()
    }

    async fn store(&self, entries: Vec<IncomingEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for entry in &entries {
            let entry_type = match entry.entry_type {
                Some(entry_type) => entry_type,
                None => continue,
            };

            if entry.is_exception() {
                store_exception(&mut tx, entry).await?;
            } else {
                insert_entry(&mut tx, entry, entry_type, &entry.content).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, updates: Vec<EntryUpdate>) -> Result<()> {
        for update in updates {
            let row = sqlx::query("SELECT content FROM entries WHERE uuid = ? AND type = ?")
                .bind(&update.uuid)
                .bind(update.entry_type.as_str())
                .fetch_optional(&self.pool)
                .await?;

            let row = match row {
                Some(row) => row,
                None => continue,
            };

            let content: String = row.get("content");
            let mut content: Map<String, Value> = serde_json::from_str(&content)?;
            for (key, value) in update.changes {
                content.insert(key, value);
            }

            sqlx::query("UPDATE entries SET content = ? WHERE uuid = ?")
                .bind(serde_json::to_string(&content)?)
                .bind(&update.uuid)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn monitoring(&self) -> Result<Vec<String>> {
        let tags = sqlx::query("SELECT tag FROM monitored_tags")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.get("tag"))
            .collect();
        Ok(tags)
    }

    async fn monitor(&self, tags: &[String]) -> Result<()> {
        for tag in tags {
            sqlx::query("INSERT OR IGNORE INTO monitored_tags (tag) VALUES (?)")
                .bind(tag)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn stop_monitoring(&self, tags: &[String]) -> Result<()> {
        for tag in tags {
            sqlx::query("DELETE FROM monitored_tags WHERE tag = ?")
                .bind(tag)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn is_monitoring(&self, tags: &[String]) -> Result<bool> {
        let cached = self.monitored_tags.lock().clone();
        let monitored = match cached {
            Some(monitored) => monitored,
            None => {
                let monitored: HashSet<String> = self.monitoring().await?.into_iter().collect();
                *self.monitored_tags.lock() = Some(monitored.clone());
                monitored
            }
        };

        Ok(tags.iter().any(|tag| monitored.contains(tag)))
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM entries WHERE created_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "DELETE FROM entry_tags WHERE entry_uuid NOT IN (SELECT uuid FROM entries)",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn prune_entries(&self, entry_type: EntryType, keep: u64) -> Result<u64> {
        let result = if keep == 0 {
            sqlx::query("DELETE FROM entries WHERE type = ?")
                .bind(entry_type.as_str())
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query(
                "DELETE FROM entries WHERE type = ? AND sequence NOT IN (
                     SELECT sequence FROM entries WHERE type = ?
                     ORDER BY sequence DESC LIMIT ?
                 )",
            )
            .bind(entry_type.as_str())
            .bind(entry_type.as_str())
            .bind(keep as i64)
            .execute(&self.pool)
            .await?
        };

        sqlx::query(
            "DELETE FROM entry_tags WHERE entry_uuid NOT IN (SELECT uuid FROM entries)",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn terminate(&self) {
        *self.monitored_tags.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_repository() -> (TempDir, DatabaseEntriesRepository) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}/telemetry.db", dir.path().display());
        let repository = DatabaseEntriesRepository::new(&url).await.unwrap();
        (dir, repository)
    }

    fn query_entry(batch: &str, tags: Vec<&str>) -> IncomingEntry {
        let mut content = Map::new();
        content.insert("sql".to_string(), json!("select 1"));
        IncomingEntry::new(content)
            .entry_type(EntryType::Query)
            .batch_id(batch)
            .tags(tags.into_iter().map(String::from))
    }

    #[tokio::test]
    async fn test_store_and_find_round_trip() {
        let (_dir, repository) = create_test_repository().await;

        let entry = query_entry("b1", vec!["users:1"]);
        let uuid = entry.uuid.clone();
        repository.store(vec![entry]).await.unwrap();

        let found = repository.find(&uuid).await.unwrap();
        assert_eq!(found.id, uuid);
        assert_eq!(found.batch_id, "b1");
        assert_eq!(found.entry_type, EntryType::Query);
        assert_eq!(found.content["sql"], json!("select 1"));
        assert_eq!(found.tags, vec!["users:1"]);
        assert!(found.sequence.is_some());
    }

    #[tokio::test]
    async fn test_find_missing_entry_is_not_found() {
        let (_dir, repository) = create_test_repository().await;
        let error = repository.find("missing").await.unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_monitoring_cache_invalidated_by_terminate() {
        let (_dir, repository) = create_test_repository().await;

        let tags = vec!["users:1".to_string()];
        assert!(!repository.is_monitoring(&tags).await.unwrap());

        // The negative result is cached for the unit of work.
        repository.monitor(&tags).await.unwrap();
        assert!(!repository.is_monitoring(&tags).await.unwrap());

        repository.terminate().await;
        assert!(repository.is_monitoring(&tags).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_entries_keeps_newest() {
        let (_dir, repository) = create_test_repository().await;

        for i in 0..5 {
            repository
                .store(vec![query_entry(&format!("b{}", i), vec![])])
                .await
                .unwrap();
        }

        let removed = repository
            .prune_entries(EntryType::Query, 2)
            .await
            .unwrap();
        assert_eq!(removed, 3);

        let remaining = repository
            .get(Some(EntryType::Query), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].batch_id, "b4");
        assert_eq!(remaining[1].batch_id, "b3");
    }
}
