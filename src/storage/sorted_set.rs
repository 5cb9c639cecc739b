//! Key/sorted-set storage backend
//!
//! Each entry is a hash blob keyed by id, indexed three ways: a
//! `type:{type}` sorted set per entry type, a `tag:{tag}` sorted set per
//! tag, and a `batch:{batch_id}` plain set. Index scores are the
//! backend-assigned sequence, derived from the creation timestamp in
//! microseconds, so an age cutoff translates directly to a score bound.
//!
//! Every index key created is also registered in a `prunable` set, letting
//! `prune` discover live indices without enumerating types and tags, and
//! every key carries the configured lifetime TTL so growth stays bounded
//! even when pruning never runs.

use crate::entry::{EntryResult, EntryType, EntryUpdate, IncomingEntry};
use crate::error::{Error, Result};
use crate::storage::keyspace::{Keyspace, Pipe};
use crate::storage::{EntriesRepository, QueryOptions};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const KEY_PREFIX: &str = "spyglass";

/// Temporary intersection results only need to survive the read that
/// created them.
const TEMP_KEY_TTL: Duration = Duration::from_secs(30);

fn entry_key(uuid: &str) -> String {
    format!("{}:{}", KEY_PREFIX, uuid)
}

fn type_key(entry_type: EntryType) -> String {
    format!("{}:type:{}", KEY_PREFIX, entry_type.as_str())
}

fn tag_key(tag: &str) -> String {
    format!("{}:tag:{}", KEY_PREFIX, tag)
}

fn batch_key(batch_id: &str) -> String {
    format!("{}:batch:{}", KEY_PREFIX, batch_id)
}

fn family_key(family_hash: &str) -> String {
    format!("{}:family:{}", KEY_PREFIX, family_hash)
}

fn monitoring_key() -> String {
    format!("{}:monitoring", KEY_PREFIX)
}

fn prunable_key() -> String {
    format!("{}:prunable", KEY_PREFIX)
}

/// Sorted-set entries repository over the in-process [`Keyspace`].
pub struct SortedSetEntriesRepository {
    keyspace: Arc<Keyspace>,
    lifetime: Duration,

    /// Last sequence handed out. Sequences are timestamp-derived but
    /// bumped past the previous one so they strictly increase even when
    /// two entries land in the same microsecond.
    last_sequence: AtomicI64,
}

impl SortedSetEntriesRepository {
    pub fn new(keyspace: Arc<Keyspace>, lifetime: Duration) -> Self {
        Self {
            keyspace,
            lifetime,
            last_sequence: AtomicI64::new(0),
        }
    }

    fn next_sequence(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let previous = self
            .last_sequence
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(last.max(now - 1) + 1)
            })
            .unwrap_or(now - 1);
        previous.max(now - 1) + 1
    }

    /// Ranked ids for a type listing, newest first. The cursor maps to an
    /// inclusive score bound made exclusive by skipping the cursor entry
    /// itself.
    fn listing_ids(
        &self,
        pipe: &mut Pipe<'_>,
        entry_type: EntryType,
        options: &QueryOptions,
    ) -> Vec<(String, i64)> {
        let max = options.before_sequence;
        let offset = if options.before_sequence.is_some() { 1 } else { 0 };
        let limit = Some(options.limit as usize);

        match &options.tag {
            None => pipe.zrevrangebyscore(&type_key(entry_type), max, offset, limit),
            Some(tag) => {
                let temp = format!("{}:_temp:{}:{}", KEY_PREFIX, entry_type.as_str(), tag);
                pipe.zinterstore_max(&temp, &type_key(entry_type), &tag_key(tag));
                pipe.expire(&temp, TEMP_KEY_TTL);
                pipe.zrevrangebyscore(&temp, max, offset, limit)
            }
        }
    }
}

fn blob_field(blob: &HashMap<String, String>, field: &str) -> Result<String> {
    blob.get(field)
        .cloned()
        .ok_or_else(|| Error::Storage(format!("entry blob missing field {}", field).into()))
}

fn blob_to_result(blob: &HashMap<String, String>, sequence: Option<i64>) -> Result<EntryResult> {
    let type_name = blob_field(blob, "type")?;
    let entry_type = EntryType::parse(&type_name)
        .ok_or_else(|| Error::Storage(format!("unknown entry type {}", type_name).into()))?;

    let sequence = match sequence {
        Some(sequence) => Some(sequence),
        None => blob.get("sequence").and_then(|raw| raw.parse().ok()),
    };

    Ok(EntryResult {
        id: blob_field(blob, "uuid")?,
        sequence,
        batch_id: blob_field(blob, "batch_id")?,
        entry_type,
        content: serde_json::from_str(&blob_field(blob, "content")?)?,
        tags: serde_json::from_str(&blob_field(blob, "tags")?)?,
        created_at: DateTime::parse_from_rfc3339(&blob_field(blob, "created_at")?)?
            .with_timezone(&Utc),
    })
}

fn is_hidden(blob: &HashMap<String, String>) -> bool {
    blob.get("should_display_on_index")
        .is_some_and(|flag| flag == "0")
}

#[async_trait]
impl EntriesRepository for SortedSetEntriesRepository {
    async fn find(&self, id: &str) -> Result<EntryResult> {
        let blob = self.keyspace.pipeline(|pipe| pipe.hgetall(&entry_key(id)));
        match blob {
            Some(blob) => blob_to_result(&blob, None),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    async fn get(
        &self,
        entry_type: Option<EntryType>,
        options: &QueryOptions,
    ) -> Result<Vec<EntryResult>> {
        let options = options.normalized();

        let entry_type = match (entry_type, &options.batch_id) {
            (None, Some(batch_id)) => {
                let blobs = self.keyspace.pipeline(|pipe| {
                    pipe.smembers(&batch_key(batch_id))
                        .iter()
                        .filter_map(|uuid| pipe.hgetall(&entry_key(uuid)))
                        .collect::<Vec<_>>()
                });

                let mut results: Vec<EntryResult> = blobs
                    .iter()
                    .map(|blob| blob_to_result(blob, None))
                    .collect::<Result<_>>()?;
                results.sort_by_key(|result| result.sequence);
                return Ok(results);
            }
            (None, None) => {
                // No global index exists; the degraded default is empty.
                tracing::warn!("Listing without a type requires a batch id, returning nothing");
                return Ok(Vec::new());
            }
            (Some(entry_type), _) => entry_type,
        };

        let hydrated = self.keyspace.pipeline(|pipe| {
            self.listing_ids(pipe, entry_type, &options)
                .into_iter()
                .filter_map(|(uuid, sequence)| {
                    pipe.hgetall(&entry_key(&uuid))
                        .map(|blob| (blob, sequence))
                })
                .collect::<Vec<_>>()
        });

        hydrated
            .iter()
            .filter(|(blob, _)| !is_hidden(blob))
            .map(|(blob, sequence)| blob_to_result(blob, Some(*sequence)))
            .collect()
    }

    async fn store(&self, entries: Vec<IncomingEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let lifetime = self.lifetime;
        let sequenced: Vec<(IncomingEntry, i64)> = entries
            .into_iter()
            .map(|entry| {
                let sequence = self.next_sequence();
                (entry, sequence)
            })
            .collect();

        self.keyspace.pipeline(|pipe| {
            for (entry, sequence) in &sequenced {
                let entry_type = match entry.entry_type {
                    Some(entry_type) => entry_type,
                    None => continue,
                };

                let mut content = entry.content.clone();

                if entry.is_exception() {
                    if let Some(family_hash) = &entry.family_hash {
                        let family = family_key(family_hash);
                        let occurrences = pipe.zcard(&family);

                        // Supersede prior occurrences: hide their blobs and
                        // drop them from the exception index.
                        for prior in pipe.zrevrange_from(&family, 0) {
                            pipe.hset(
                                &entry_key(&prior),
                                vec![("should_display_on_index".to_string(), "0".to_string())],
                            );
                            pipe.zrem(&type_key(EntryType::Exception), &[prior]);
                        }

                        content.insert("occurrences".to_string(), Value::from(occurrences as i64));

                        pipe.zadd(&family, *sequence, entry.uuid.clone());
                        pipe.sadd(&prunable_key(), vec![family.clone()]);
                        pipe.expire(&family, lifetime);
                    }
                }

                let blob_key = entry_key(&entry.uuid);
                let mut fields = vec![
                    ("uuid".to_string(), entry.uuid.clone()),
                    (
                        "batch_id".to_string(),
                        entry.batch_id.clone().unwrap_or_default(),
                    ),
                    ("type".to_string(), entry_type.as_str().to_string()),
                    ("content".to_string(), serde_json::to_string(&content)?),
                    ("tags".to_string(), serde_json::to_string(&entry.tags)?),
                    ("created_at".to_string(), entry.created_at.to_rfc3339()),
                    ("sequence".to_string(), sequence.to_string()),
                    ("should_display_on_index".to_string(), "1".to_string()),
                ];
                if let Some(family_hash) = &entry.family_hash {
                    fields.push(("family_hash".to_string(), family_hash.clone()));
                }

                pipe.hset(&blob_key, fields);
                pipe.expire(&blob_key, lifetime);

                let type_index = type_key(entry_type);
                pipe.zadd(&type_index, *sequence, entry.uuid.clone());
                pipe.sadd(&prunable_key(), vec![type_index.clone()]);
                pipe.expire(&type_index, lifetime);

                for tag in &entry.tags {
                    let tag_index = tag_key(tag);
                    pipe.zadd(&tag_index, *sequence, entry.uuid.clone());
                    pipe.sadd(&prunable_key(), vec![tag_index.clone()]);
                    pipe.expire(&tag_index, lifetime);
                }

                if let Some(batch_id) = &entry.batch_id {
                    let batch = batch_key(batch_id);
                    pipe.sadd(&batch, vec![entry.uuid.clone()]);
                    pipe.expire(&batch, lifetime);
                }
            }

            Ok(())
        })
    }

    async fn update(&self, updates: Vec<EntryUpdate>) -> Result<()> {
        self.keyspace.pipeline(|pipe| {
            for update in updates {
                let key = entry_key(&update.uuid);
                let blob = match pipe.hgetall(&key) {
                    Some(blob) => blob,
                    None => continue,
                };

                let raw = blob_field(&blob, "content")?;
                let mut content: Map<String, Value> = serde_json::from_str(&raw)?;
                for (field, value) in update.changes {
                    content.insert(field, value);
                }

                pipe.hset(
                    &key,
                    vec![("content".to_string(), serde_json::to_string(&content)?)],
                );
            }
            Ok(())
        })
    }

    async fn monitoring(&self) -> Result<Vec<String>> {
        let mut tags = self
            .keyspace
            .pipeline(|pipe| pipe.smembers(&monitoring_key()));
        tags.sort();
        Ok(tags)
    }

    async fn monitor(&self, tags: &[String]) -> Result<()> {
        self.keyspace.pipeline(|pipe| {
            let current = pipe.smembers(&monitoring_key());
            let missing: Vec<String> = tags
                .iter()
                .filter(|tag| !current.contains(*tag))
                .cloned()
                .collect();
            if !missing.is_empty() {
                pipe.sadd(&monitoring_key(), missing);
            }
        });
        Ok(())
    }

    async fn stop_monitoring(&self, tags: &[String]) -> Result<()> {
        self.keyspace
            .pipeline(|pipe| pipe.srem(&monitoring_key(), tags));
        Ok(())
    }

    async fn is_monitoring(&self, tags: &[String]) -> Result<bool> {
        let monitored = self
            .keyspace
            .pipeline(|pipe| pipe.smembers(&monitoring_key()));
        Ok(tags.iter().any(|tag| monitored.contains(tag)))
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<u64> {
        // Normalize to the start of the cutoff day, in sequence scale.
        let cutoff = before
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp_micros();

        let removed = self.keyspace.pipeline(|pipe| {
            let mut removed = 0;
            for index in pipe.smembers(&prunable_key()) {
                let is_type_index = index.starts_with(&format!("{}:type:", KEY_PREFIX));
                if is_type_index {
                    // Aged-out members of a type index are dead entries:
                    // delete their blobs along with the index rows.
                    let stale: Vec<String> = pipe
                        .zrevrangebyscore(&index, Some(cutoff), 0, None)
                        .into_iter()
                        .map(|(member, _)| member)
                        .collect();
                    for uuid in &stale {
                        pipe.del(&entry_key(uuid));
                    }
                    removed += pipe.zrem(&index, &stale);
                } else {
                    pipe.zremrangebyscore_upto(&index, cutoff);
                }
            }
            removed
        });

        Ok(removed)
    }

    async fn prune_entries(&self, entry_type: EntryType, keep: u64) -> Result<u64> {
        let removed = self.keyspace.pipeline(|pipe| {
            let index = type_key(entry_type);
            let stale = pipe.zrevrange_from(&index, keep as usize);
            for uuid in &stale {
                pipe.del(&entry_key(uuid));
            }
            pipe.zrem(&index, &stale)
        });

        Ok(removed)
    }
}
