//! Telemetry record types
//!
//! [`IncomingEntry`] is the producer-facing record: watchers build one from
//! free-form content and hand it to the recorder. [`EntryResult`] is the
//! stored form returned by the storage backends, carrying the
//! backend-assigned sequence used as the pagination cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// The kind of activity a telemetry entry captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Request,
    Query,
    Job,
    Exception,
    Event,
    Notification,
    Mail,
    Cache,
    Log,
    Command,
    /// Scheduled task execution.
    Schedule,
    /// Model lifecycle event (created/updated/deleted).
    Model,
    Redis,
    Dump,
}

impl EntryType {
    /// Wire name used in storage and index keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Query => "query",
            Self::Job => "job",
            Self::Exception => "exception",
            Self::Event => "event",
            Self::Notification => "notification",
            Self::Mail => "mail",
            Self::Cache => "cache",
            Self::Log => "log",
            Self::Command => "command",
            Self::Schedule => "schedule",
            Self::Model => "model",
            Self::Redis => "redis",
            Self::Dump => "dump",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "request" => Self::Request,
            "query" => Self::Query,
            "job" => Self::Job,
            "exception" => Self::Exception,
            "event" => Self::Event,
            "notification" => Self::Notification,
            "mail" => Self::Mail,
            "cache" => Self::Cache,
            "log" => Self::Log,
            "command" => Self::Command,
            "schedule" => Self::Schedule,
            "model" => Self::Model,
            "redis" => Self::Redis,
            "dump" => Self::Dump,
            _ => return None,
        })
    }

    /// Types subject to the per-type retention bound. Dumps are excluded:
    /// they expire with their entry point rather than on their own schedule.
    pub fn prunable() -> &'static [EntryType] {
        &[
            Self::Cache,
            Self::Command,
            Self::Event,
            Self::Exception,
            Self::Log,
            Self::Mail,
            Self::Notification,
            Self::Query,
            Self::Request,
            Self::Schedule,
            Self::Redis,
            Self::Model,
        ]
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A telemetry record queued for storage.
///
/// Built by watchers via [`IncomingEntry::new`] plus the fluent setters,
/// then typed and enriched by the recorder before it reaches a backend.
///
/// # Example
///
/// ```ignore
/// let entry = IncomingEntry::new(content)
///     .tags(vec!["users:42".to_string()])
///     .family_hash(exception_family_hash("DivisionByZero", "src/math.rs", 17));
/// recorder.record_exception(entry);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingEntry {
    /// Globally unique identifier, assigned at creation time.
    pub uuid: String,

    /// Assigned by the recorder; `None` only before a record call.
    pub entry_type: Option<EntryType>,

    /// Groups every entry flushed from one unit of work. Assigned exactly
    /// once, at flush time.
    pub batch_id: Option<String>,

    /// Free-form content. Key order is preserved through storage.
    pub content: Map<String, Value>,

    /// Duplicate-free, order-preserving tag list.
    pub tags: Vec<String>,

    /// Exception family fingerprint; present only for exception entries.
    pub family_hash: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl IncomingEntry {
    pub fn new(content: Map<String, Value>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            entry_type: None,
            batch_id: None,
            content,
            tags: Vec::new(),
            family_hash: None,
            created_at: Utc::now(),
        }
    }

    pub fn entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = Some(entry_type);
        self
    }

    /// Merge tags into the entry, preserving insertion order and dropping
    /// duplicates.
    pub fn tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        for tag in tags {
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        self
    }

    pub fn batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn family_hash(mut self, family_hash: impl Into<String>) -> Self {
        self.family_hash = Some(family_hash.into());
        self
    }

    pub fn is_exception(&self) -> bool {
        self.entry_type == Some(EntryType::Exception)
    }

    pub fn is_dump(&self) -> bool {
        self.entry_type == Some(EntryType::Dump)
    }

    /// Attach the acting user to the entry: an `actor` object in the content
    /// plus a `kind:id` tag so actor activity is queryable by tag.
    pub fn actor(&mut self, actor: &Actor) {
        let mut object = Map::new();
        object.insert("id".to_string(), Value::String(actor.id.clone()));
        if let Some(name) = &actor.name {
            object.insert("name".to_string(), Value::String(name.clone()));
        }
        self.content.insert("actor".to_string(), Value::Object(object));

        let tag = format!("{}:{}", actor.kind, actor.id);
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    /// Point a dump entry at the activity that produced it: the first
    /// non-dump entry of the batch, recorded as `entry_point` provenance.
    pub fn assign_entry_point(&mut self, entry_point_uuid: &str, entry_point_type: EntryType) {
        let mut object = Map::new();
        object.insert(
            "id".to_string(),
            Value::String(entry_point_uuid.to_string()),
        );
        object.insert(
            "type".to_string(),
            Value::String(entry_point_type.as_str().to_string()),
        );
        self.content
            .insert("entry_point".to_string(), Value::Object(object));
    }
}

/// The acting user (or other principal) of the current unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    /// Entity kind, e.g. `"user"`.
    pub kind: String,
    pub id: String,
    pub name: Option<String>,
}

impl Actor {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A stored telemetry record, as returned by the storage backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryResult {
    pub id: String,

    /// Backend-assigned, strictly increasing per backend instance. Used as
    /// the pagination cursor.
    pub sequence: Option<i64>,

    pub batch_id: String,

    #[serde(rename = "type")]
    pub entry_type: EntryType,

    pub content: Map<String, Value>,

    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,
}

/// A deferred change to an already-recorded entry, merged into its content
/// at flush time. Used when a value is only known after the original event,
/// e.g. a job's final status.
#[derive(Debug, Clone)]
pub struct EntryUpdate {
    pub uuid: String,
    pub entry_type: EntryType,
    pub changes: Map<String, Value>,
}

impl EntryUpdate {
    pub fn new(uuid: impl Into<String>, entry_type: EntryType) -> Self {
        Self {
            uuid: uuid.into(),
            entry_type,
            changes: Map::new(),
        }
    }

    pub fn change(mut self, key: impl Into<String>, value: Value) -> Self {
        self.changes.insert(key.into(), value);
        self
    }
}

/// Fingerprint grouping recurring exceptions by class and source location.
pub fn exception_family_hash(class: &str, file: &str, line: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(class.as_bytes());
    hasher.update(file.as_bytes());
    hasher.update(line.to_le_bytes());
    let digest = hasher.finalize();
    // 16 bytes of the digest is plenty to key a family.
    hex_encode(&digest[..16])
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_tags_deduplicate_and_preserve_order() {
        let entry = IncomingEntry::new(Map::new())
            .tags(vec!["users:1".to_string(), "orders:2".to_string()])
            .tags(vec!["users:1".to_string(), "mail".to_string()]);

        assert_eq!(entry.tags, vec!["users:1", "orders:2", "mail"]);
    }

    #[test]
    fn test_entry_type_round_trips_through_wire_name() {
        for entry_type in EntryType::prunable() {
            assert_eq!(EntryType::parse(entry_type.as_str()), Some(*entry_type));
        }
        assert_eq!(EntryType::parse("dump"), Some(EntryType::Dump));
        assert_eq!(EntryType::parse("bogus"), None);
    }

    #[test]
    fn test_actor_attachment() {
        let mut entry = IncomingEntry::new(content(&[("uri", json!("/home"))]));
        entry.actor(&Actor::new("user", "42").named("Taylor"));

        assert_eq!(entry.content["actor"]["id"], json!("42"));
        assert_eq!(entry.content["actor"]["name"], json!("Taylor"));
        assert!(entry.tags.contains(&"user:42".to_string()));
    }

    #[test]
    fn test_entry_point_provenance() {
        let mut dump = IncomingEntry::new(content(&[("dump", json!("x = 3"))]))
            .entry_type(EntryType::Dump);
        dump.assign_entry_point("abc", EntryType::Request);

        assert_eq!(dump.content["entry_point"]["id"], json!("abc"));
        assert_eq!(dump.content["entry_point"]["type"], json!("request"));
    }

    #[test]
    fn test_family_hash_is_deterministic_and_location_sensitive() {
        let a = exception_family_hash("DivisionByZero", "src/math.rs", 17);
        let b = exception_family_hash("DivisionByZero", "src/math.rs", 17);
        let c = exception_family_hash("DivisionByZero", "src/math.rs", 18);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
