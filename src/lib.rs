//! Spyglass: in-process telemetry capture and storage
//!
//! Watchers observe activity inside a running application and hand each
//! observation to a per-unit-of-work recorder; at the end of the unit the
//! queued entries flush as one batch to a pluggable storage backend.
//!
//! ```text
//! Layer 1: Capture (watchers -> Recorder queue, in-memory)
//!     ↓
//! Layer 2: Storage (one flush per unit of work, SQLite or sorted-set)
//!     ↓
//! Layer 3: Query (find / get / monitoring, straight from the backend)
//! ```
//!
//! ## Design Principles
//!
//! - **Capture never blocks**: recording is synchronous and I/O-free
//! - **Loss over breakage**: a storage outage drops telemetry, never the
//!   host operation
//! - **Bounded retention**: per-type limits at flush time plus scheduled
//!   age-based pruning

pub mod config;
pub mod entry;
pub mod error;
pub mod prune;
pub mod recorder;
pub mod storage;
pub mod tags;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// Note: This function can only be called once per process.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
