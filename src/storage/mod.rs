//! Storage backends for telemetry entries
//!
//! One contract, two materially different implementations:
//!
//! - [`DatabaseEntriesRepository`]: relational, over SQLite. Entries and
//!   their tags live in two tables; the auto-incrementing row id is the
//!   pagination sequence.
//! - [`SortedSetEntriesRepository`]: key/sorted-set, over the in-process
//!   [`keyspace`] engine. Per-entry hash blobs plus score-ordered type and
//!   tag indices; TTL bounds growth even without explicit pruning.
//!
//! Readers call [`EntriesRepository::get`] and
//! [`EntriesRepository::find`] directly; writes arrive only through the
//! recorder's end-of-unit flush.

pub mod database;
pub mod keyspace;
pub mod sorted_set;

pub use database::DatabaseEntriesRepository;
pub use keyspace::Keyspace;
pub use sorted_set::SortedSetEntriesRepository;

use crate::entry::{EntryResult, EntryType, EntryUpdate, IncomingEntry};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// How a read should be filtered and paginated.
///
/// Pages chain through `before_sequence`: passing the minimum sequence of
/// the previous page yields the next page with no overlap.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Return the whole batch instead of a type/tag listing.
    pub batch_id: Option<String>,

    /// Restrict a listing to entries carrying this tag. At most one.
    pub tag: Option<String>,

    /// Exclusive upper bound on the sequence cursor.
    pub before_sequence: Option<i64>,

    /// Page size.
    pub limit: i64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            batch_id: None,
            tag: None,
            before_sequence: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl QueryOptions {
    pub fn for_batch(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: Some(batch_id.into()),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn before_sequence(mut self, sequence: i64) -> Self {
        self.before_sequence = Some(sequence);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Reject contradictory combinations: a batch read is its own query
    /// shape and composes with neither tag filtering nor a cursor.
    pub fn validate(&self) -> Result<()> {
        if self.batch_id.is_some() && self.tag.is_some() {
            return Err(Error::MalformedQuery(
                "batch_id and tag are mutually exclusive".to_string(),
            ));
        }
        if self.batch_id.is_some() && self.before_sequence.is_some() {
            return Err(Error::MalformedQuery(
                "batch_id and before_sequence are mutually exclusive".to_string(),
            ));
        }
        if self.limit <= 0 {
            return Err(Error::MalformedQuery("limit must be positive".to_string()));
        }
        Ok(())
    }

    /// Malformed options degrade to a usable default instead of failing the
    /// read: the offending filters are stripped and the limit restored.
    pub(crate) fn normalized(&self) -> QueryOptions {
        match self.validate() {
            Ok(()) => self.clone(),
            Err(error) => {
                tracing::warn!(error = %error, "Malformed query options, falling back to default listing");
                QueryOptions {
                    batch_id: self.batch_id.clone(),
                    tag: None,
                    before_sequence: None,
                    limit: if self.limit > 0 {
                        self.limit
                    } else {
                        DEFAULT_PAGE_SIZE
                    },
                }
            }
        }
    }
}

/// The storage contract every backend implements with identical semantics.
#[async_trait]
pub trait EntriesRepository: Send + Sync {
    /// Exact lookup by entry id.
    async fn find(&self, id: &str) -> Result<EntryResult>;

    /// List entries newest-first by sequence.
    ///
    /// With `entry_type` unset the options must name a `batch_id` and the
    /// whole batch is returned in creation order; without one the call
    /// degrades to the backend's default listing rather than failing.
    async fn get(
        &self,
        entry_type: Option<EntryType>,
        options: &QueryOptions,
    ) -> Result<Vec<EntryResult>>;

    /// Persist a flushed batch. Exception entries pass through family
    /// deduplication before the generic insert.
    async fn store(&self, entries: Vec<IncomingEntry>) -> Result<()>;

    /// Merge deferred content updates into already-stored entries. Updates
    /// whose target no longer exists are skipped.
    async fn update(&self, updates: Vec<EntryUpdate>) -> Result<()>;

    /// The tags currently being monitored.
    async fn monitoring(&self) -> Result<Vec<String>>;

    /// Begin monitoring the given tags. Idempotent: only tags not already
    /// monitored are added.
    async fn monitor(&self, tags: &[String]) -> Result<()>;

    async fn stop_monitoring(&self, tags: &[String]) -> Result<()>;

    /// Whether any of the given tags is currently monitored.
    async fn is_monitoring(&self, tags: &[String]) -> Result<bool>;

    /// Remove entries created before the cutoff. Returns how many entries
    /// were removed.
    async fn prune(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Bound retention for one type: keep the newest `keep` entries and
    /// remove the rest. Returns how many entries were removed.
    async fn prune_entries(&self, entry_type: EntryType, keep: u64) -> Result<u64>;

    /// Clear per-unit-of-work cached state. Called once per flush.
    async fn terminate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = QueryOptions::default();
        assert_eq!(options.limit, DEFAULT_PAGE_SIZE);
        assert!(options.batch_id.is_none());
        assert!(options.tag.is_none());
        assert!(options.before_sequence.is_none());
    }

    #[test]
    fn test_batch_and_tag_are_mutually_exclusive() {
        let options = QueryOptions::for_batch("b1").with_tag("users:1");
        assert!(options.validate().is_err());

        let normalized = options.normalized();
        assert_eq!(normalized.batch_id.as_deref(), Some("b1"));
        assert!(normalized.tag.is_none());
    }

    #[test]
    fn test_zero_limit_degrades_to_default_page_size() {
        let options = QueryOptions::default().limit(0);
        assert!(options.validate().is_err());
        assert_eq!(options.normalized().limit, DEFAULT_PAGE_SIZE);
    }
}
