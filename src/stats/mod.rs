//! Operational counters and device liveness.

pub mod liveness;
pub mod log;

pub use liveness::{DeviceLiveness, LivenessTracker};
pub use log::{
    create_shared_stats, create_shared_stats_with_persistence, read_persisted, IngestSnapshot,
    IngestStats, PersistedStats, SharedIngestStats,
};
