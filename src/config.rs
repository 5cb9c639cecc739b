use crate::prune::PruneConfig;
use crate::recorder::CapturePolicy;
use crate::storage::{
    DatabaseEntriesRepository, EntriesRepository, Keyspace, SortedSetEntriesRepository,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpyglassConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub prune: PruneSettings,
}

impl Default for SpyglassConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            capture: CaptureConfig::default(),
            prune: PruneSettings::default(),
        }
    }
}

/// Backend selection and connection target.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub driver: StorageDriver,

    /// Connection target for the `database` driver.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// TTL applied to every key written by the `sorted-set` driver.
    #[serde(default = "default_lifetime_seconds")]
    pub lifetime_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: StorageDriver::default(),
            database_url: default_database_url(),
            lifetime_seconds: default_lifetime_seconds(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageDriver {
    #[default]
    Database,
    SortedSet,
}

/// What the recorder captures and how much of it is kept.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// Maximum stored entries per type, enforced after every flush.
    #[serde(default)]
    pub limit: Option<u64>,

    /// Content keys redacted before an entry is enqueued, on top of the
    /// built-in secret-like defaults.
    #[serde(default)]
    pub hidden_content_keys: Vec<String>,
}

/// Background prune schedule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PruneSettings {
    #[serde(default = "default_retain_hours")]
    pub retain_hours: i64,

    #[serde(default = "default_prune_hour")]
    pub prune_hour: u32,

    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            retain_hours: default_retain_hours(),
            prune_hour: default_prune_hour(),
            check_interval_seconds: default_check_interval_seconds(),
        }
    }
}

impl PruneSettings {
    pub fn to_prune_config(&self) -> PruneConfig {
        PruneConfig {
            retain_hours: self.retain_hours,
            prune_hour: self.prune_hour,
            check_interval: Duration::from_secs(self.check_interval_seconds),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:./data/spyglass.db".to_string()
}

fn default_lifetime_seconds() -> u64 {
    86_400
}

fn default_retain_hours() -> i64 {
    24
}

fn default_prune_hour() -> u32 {
    3
}

fn default_check_interval_seconds() -> u64 {
    3_600
}

pub fn load_config() -> anyhow::Result<SpyglassConfig> {
    let config = config::Config::builder()
        .add_source(config::File::with_name("spyglass").required(false))
        .add_source(config::Environment::with_prefix("SPYGLASS").separator("__"))
        .build()?;

    let cfg: SpyglassConfig = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &SpyglassConfig) -> anyhow::Result<()> {
    if cfg.storage.driver == StorageDriver::Database && cfg.storage.database_url.is_empty() {
        anyhow::bail!("The database driver requires a database_url");
    }

    if cfg.storage.driver == StorageDriver::SortedSet && cfg.storage.lifetime_seconds == 0 {
        anyhow::bail!("The sorted-set driver requires a non-zero lifetime");
    }

    if cfg.prune.prune_hour > 23 {
        anyhow::bail!("prune_hour must be between 0 and 23");
    }

    Ok(())
}

impl SpyglassConfig {
    /// Build the repository this configuration selects.
    pub async fn build_repository(&self) -> anyhow::Result<Arc<dyn EntriesRepository>> {
        match self.storage.driver {
            StorageDriver::Database => Ok(Arc::new(
                DatabaseEntriesRepository::new(&self.storage.database_url).await?,
            )),
            StorageDriver::SortedSet => Ok(Arc::new(SortedSetEntriesRepository::new(
                Arc::new(Keyspace::new()),
                Duration::from_secs(self.storage.lifetime_seconds),
            ))),
        }
    }

    /// Build the capture policy this configuration describes. Filters and
    /// the tag callback are code, not configuration; add them on the
    /// returned policy.
    pub fn capture_policy(&self) -> CapturePolicy {
        let mut policy =
            CapturePolicy::new().hide_content_keys(self.capture.hidden_content_keys.iter().cloned());
        if let Some(limit) = self.capture.limit {
            policy = policy.retention_limit(limit);
        }
        policy
    }
}
