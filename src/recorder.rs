//! Capture gate and per-unit-of-work entry queue
//!
//! One [`Recorder`] exists per unit of work (HTTP request, job execution,
//! console invocation). Watchers hand it entries synchronously; nothing
//! touches storage until the unit ends and [`Recorder::store`] flushes the
//! queue as a single batch. Capture policy (filters, tag enrichment,
//! redaction, retention) is shared across recorders through an
//! [`Arc<CapturePolicy>`].

use crate::entry::{Actor, EntryType, EntryUpdate, IncomingEntry};
use crate::error::{Error, Result};
use crate::storage::EntriesRepository;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

type FilterFn = dyn Fn(&IncomingEntry) -> bool + Send + Sync;
type TagFn = dyn Fn(&IncomingEntry) -> Vec<String> + Send + Sync;
type ErrorSinkFn = dyn Fn(&Error) + Send + Sync;

/// Shared capture policy: what gets recorded and how entries are enriched
/// before they reach the queue.
pub struct CapturePolicy {
    filters: Vec<Box<FilterFn>>,
    tag_callback: Option<Box<TagFn>>,
    hidden_content_keys: Vec<String>,
    retention_limit: Option<u64>,
    error_sink: Option<Box<ErrorSinkFn>>,
}

impl CapturePolicy {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            tag_callback: None,
            hidden_content_keys: vec![
                "password".to_string(),
                "password_confirmation".to_string(),
            ],
            retention_limit: None,
            error_sink: None,
        }
    }

    /// Add a filter predicate. An entry is enqueued only if every filter
    /// returns true.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&IncomingEntry) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Box::new(filter));
        self
    }

    /// Set the callback whose tags are merged into every recorded entry.
    pub fn tag_using<F>(mut self, callback: F) -> Self
    where
        F: Fn(&IncomingEntry) -> Vec<String> + Send + Sync + 'static,
    {
        self.tag_callback = Some(Box::new(callback));
        self
    }

    /// Redact additional content keys before entries are enqueued.
    pub fn hide_content_keys<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        for key in keys {
            if !self.hidden_content_keys.contains(&key) {
                self.hidden_content_keys.push(key);
            }
        }
        self
    }

    /// Cap the number of stored entries per type, enforced after every
    /// flush.
    pub fn retention_limit(mut self, limit: u64) -> Self {
        self.retention_limit = Some(limit);
        self
    }

    /// Report storage failures somewhere beyond the log, e.g. an exception
    /// handler.
    pub fn on_store_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.error_sink = Some(Box::new(sink));
        self
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CapturePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturePolicy")
            .field("filters", &self.filters.len())
            .field("tag_callback", &self.tag_callback.is_some())
            .field("hidden_content_keys", &self.hidden_content_keys)
            .field("retention_limit", &self.retention_limit)
            .finish()
    }
}

/// Buffers telemetry for one unit of work.
pub struct Recorder {
    policy: Arc<CapturePolicy>,
    recording: AtomicBool,
    actor: Mutex<Option<Actor>>,
    entries: Mutex<Vec<IncomingEntry>>,
    updates: Mutex<Vec<EntryUpdate>>,
}

impl Recorder {
    /// Recording starts disabled; the host decides eligibility and calls
    /// [`Recorder::start_recording`].
    pub fn new(policy: Arc<CapturePolicy>) -> Self {
        Self {
            policy,
            recording: AtomicBool::new(false),
            actor: Mutex::new(None),
            entries: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn start_recording(&self) {
        self.recording.store(true, Ordering::Relaxed);
    }

    pub fn stop_recording(&self) {
        self.recording.store(false, Ordering::Relaxed);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    /// Attach the acting user of this unit of work; stamped onto every
    /// entry at flush time.
    pub fn set_actor(&self, actor: Actor) {
        *self.actor.lock() = Some(actor);
    }

    /// Queue an entry of the given type. No-op while recording is off.
    /// Never blocks and performs no I/O.
    pub fn record(&self, entry_type: EntryType, entry: IncomingEntry) {
        if !self.is_recording() {
            return;
        }

        let mut entry = entry.entry_type(entry_type);

        if let Some(callback) = &self.policy.tag_callback {
            let extra = callback(&entry);
            entry = entry.tags(extra);
        }

        for key in &self.policy.hidden_content_keys {
            if entry.content.contains_key(key) {
                entry
                    .content
                    .insert(key.clone(), Value::String("********".to_string()));
            }
        }

        if self.policy.filters.iter().all(|filter| filter(&entry)) {
            self.entries.lock().push(entry);
        }
    }

    /// Queue a deferred update to an already-recorded entry.
    pub fn record_update(&self, update: EntryUpdate) {
        if self.is_recording() {
            self.updates.lock().push(update);
        }
    }

    pub fn record_request(&self, entry: IncomingEntry) {
        self.record(EntryType::Request, entry);
    }

    pub fn record_query(&self, entry: IncomingEntry) {
        self.record(EntryType::Query, entry);
    }

    pub fn record_job(&self, entry: IncomingEntry) {
        self.record(EntryType::Job, entry);
    }

    pub fn record_exception(&self, entry: IncomingEntry) {
        self.record(EntryType::Exception, entry);
    }

    pub fn record_event(&self, entry: IncomingEntry) {
        self.record(EntryType::Event, entry);
    }

    pub fn record_notification(&self, entry: IncomingEntry) {
        self.record(EntryType::Notification, entry);
    }

    pub fn record_mail(&self, entry: IncomingEntry) {
        self.record(EntryType::Mail, entry);
    }

    pub fn record_cache(&self, entry: IncomingEntry) {
        self.record(EntryType::Cache, entry);
    }

    pub fn record_log(&self, entry: IncomingEntry) {
        self.record(EntryType::Log, entry);
    }

    pub fn record_command(&self, entry: IncomingEntry) {
        self.record(EntryType::Command, entry);
    }

    pub fn record_scheduled_command(&self, entry: IncomingEntry) {
        self.record(EntryType::Schedule, entry);
    }

    pub fn record_model_event(&self, entry: IncomingEntry) {
        self.record(EntryType::Model, entry);
    }

    pub fn record_redis(&self, entry: IncomingEntry) {
        self.record(EntryType::Redis, entry);
    }

    pub fn record_dump(&self, entry: IncomingEntry) {
        self.record(EntryType::Dump, entry);
    }

    pub fn pending_entries(&self) -> usize {
        self.entries.lock().len()
    }

    /// Flush the queued batch to storage.
    ///
    /// Assigns one fresh batch id, stamps the actor, resolves dump
    /// provenance, then hands the batch to the repository followed by the
    /// queued updates, the termination hook, and one prune per entry type
    /// when a retention limit is configured. Failures are reported and
    /// swallowed; the queues are cleared no matter what.
    pub async fn store(&self, repository: &dyn EntriesRepository) {
        let entries = std::mem::take(&mut *self.entries.lock());
        if entries.is_empty() {
            return;
        }
        let updates = std::mem::take(&mut *self.updates.lock());

        let batch_id = Uuid::new_v4().to_string();
        let entries = self.collect_entries(entries, &batch_id);
        let updates = Self::collect_updates(updates, &batch_id);

        if let Err(error) = self.try_store(repository, entries, updates).await {
            tracing::error!(error = %error, batch_id = %batch_id, "Failed to store telemetry batch");
            if let Some(sink) = &self.policy.error_sink {
                sink(&error);
            }
        }
    }

    fn collect_entries(
        &self,
        mut entries: Vec<IncomingEntry>,
        batch_id: &str,
    ) -> Vec<IncomingEntry> {
        let actor = self.actor.lock().clone();
        let entry_point = entries
            .iter()
            .find(|entry| !entry.is_dump())
            .and_then(|entry| entry.entry_type.map(|t| (entry.uuid.clone(), t)));

        for entry in &mut entries {
            entry.batch_id = Some(batch_id.to_string());

            if let Some(actor) = &actor {
                entry.actor(actor);
            }

            if entry.is_dump() {
                if let Some((uuid, entry_type)) = &entry_point {
                    entry.assign_entry_point(uuid, *entry_type);
                }
            }
        }

        entries
    }

    fn collect_updates(updates: Vec<EntryUpdate>, batch_id: &str) -> Vec<EntryUpdate> {
        updates
            .into_iter()
            .map(|update| update.change("updated_batch_id", Value::String(batch_id.to_string())))
            .collect()
    }

    async fn try_store(
        &self,
        repository: &dyn EntriesRepository,
        entries: Vec<IncomingEntry>,
        updates: Vec<EntryUpdate>,
    ) -> Result<()> {
        repository.store(entries).await?;
        repository.update(updates).await?;
        repository.terminate().await;

        if let Some(limit) = self.policy.retention_limit {
            for entry_type in EntryType::prunable() {
                repository.prune_entries(*entry_type, limit).await?;
            }
        }

        Ok(())
    }
}
