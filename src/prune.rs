//! Background age-based pruning
//!
//! Deletes entries older than the configured retention window, once per
//! day at a configurable hour. Per-type retention bounds are enforced
//! separately, at flush time, by the recorder.

use crate::error::Result;
use crate::storage::EntriesRepository;
use chrono::{Datelike, Duration as ChronoDuration, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

/// Prune schedule configuration.
#[derive(Debug, Clone, Copy)]
pub struct PruneConfig {
    /// How long entries are retained, in hours.
    pub retain_hours: i64,

    /// Hour of day to run the prune (0-23).
    pub prune_hour: u32,

    /// How often to check whether it's prune time.
    pub check_interval: Duration,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            retain_hours: 24,
            prune_hour: 3,
            check_interval: Duration::from_secs(3600),
        }
    }
}

/// Spawn the background prune task.
///
/// # Example
///
/// ```ignore
/// let repository: Arc<dyn EntriesRepository> = config.build_repository().await?;
/// spawn_prune_task(repository.clone(), PruneConfig::default());
/// ```
pub fn spawn_prune_task(
    repository: Arc<dyn EntriesRepository>,
    config: PruneConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        prune_loop(repository, config).await;
    })
}

async fn prune_loop(repository: Arc<dyn EntriesRepository>, config: PruneConfig) {
    let mut interval = time::interval(config.check_interval);
    let mut last_prune_day: Option<u32> = None;

    loop {
        interval.tick().await;

        let now = Utc::now();
        if now.hour() != config.prune_hour || Some(now.ordinal()) == last_prune_day {
            continue;
        }

        match run_prune_now(repository.as_ref(), config.retain_hours).await {
            Ok(removed) => {
                tracing::info!(
                    removed = removed,
                    retain_hours = config.retain_hours,
                    "Pruned aged-out telemetry entries"
                );
                last_prune_day = Some(now.ordinal());
            }
            Err(error) => {
                tracing::error!(error = %error, "Prune failed");
            }
        }
    }
}

/// Prune immediately, removing entries older than `retain_hours`.
pub async fn run_prune_now(
    repository: &dyn EntriesRepository,
    retain_hours: i64,
) -> Result<u64> {
    let before = Utc::now() - ChronoDuration::hours(retain_hours);
    repository.prune(before).await
}
