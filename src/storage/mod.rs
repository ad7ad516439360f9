//! Persistence for sessions, samples and aggregates.
//!
//! The [`Store`] trait is the seam between the session/buffer core and the
//! storage engine. [`LibsqlStore`] is the SQLite-backed implementation;
//! [`StorageWriter`] wraps any store with batch retry semantics.

mod libsql_store;
mod schema;
pub mod writer;

pub use libsql_store::LibsqlStore;
pub use writer::{StorageWriter, WriteOutcome};

use crate::core::aggregate::Aggregate;
use crate::core::sample::Sample;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage connection failed: {message}")]
    Connection { message: String },
    #[error("storage initialization failed: {message}")]
    Initialization { message: String },
    #[error("storage migration failed: {message}")]
    Migration { message: String },
    #[error("storage query failed: {message}")]
    Query { message: String },
    #[error("storage busy: {message}")]
    Busy { message: String },
    #[error("storage serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session `{session_id}` not found")]
    NotFound { session_id: String },
}

impl StorageError {
    /// Whether retrying the same operation may succeed (lock contention,
    /// dropped connections).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Connection { .. } | StorageError::Busy { .. }
        )
    }
}

/// A row of the `sessions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub device_id: String,
    pub device_name: Option<String>,
    pub start_time: f64,
    /// `None` while the session is open
    pub end_time: Option<f64>,
}

/// An open session found in storage that is still within the activity gap.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSession {
    pub session_id: String,
    pub device_name: Option<String>,
    pub start_time: f64,
    /// Timestamp of the most recent persisted sample, if any were written
    pub last_sample_at: Option<f64>,
}

/// Session listing row with light per-session figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: SessionRecord,
    pub sample_count: u64,
    /// Samples carrying a heart rate reading
    pub hr_sample_count: u64,
    pub avg_hr: Option<f64>,
    pub total_distance: Option<f64>,
}

/// Statistics over all persisted samples of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub sample_count: u64,
    pub first_sample_at: Option<f64>,
    pub last_sample_at: Option<f64>,
    pub min_hr: Option<i32>,
    pub max_hr: Option<i32>,
    pub avg_hr: Option<f64>,
    pub avg_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub avg_cadence: Option<f64>,
    pub total_distance: Option<f64>,
}

impl SessionStats {
    /// Span between the first and last persisted sample, in seconds.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.first_sample_at, self.last_sample_at) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        }
    }
}

/// Filter for session listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub device_id: Option<String>,
    /// Only sessions starting after this Unix time
    pub started_after: Option<f64>,
    pub limit: Option<u32>,
}

/// Time range and limit for sample reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub limit: Option<u32>,
}

/// Backing store consumed by the session manager and storage writer.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new open session. Any other session of the same device that
    /// is still open in storage is closed at its last sample time.
    async fn create_session(&self, session: &SessionRecord) -> Result<(), StorageError>;

    /// Set a session's end time. Returns `false` if it was already closed or
    /// does not exist; an end time is never overwritten.
    async fn close_session(&self, session_id: &str, end_time: f64) -> Result<bool, StorageError>;

    /// Most recent open session of `device_id` whose last sample (or start,
    /// when nothing was written yet) is at or after `active_since`.
    async fn find_open_session(
        &self,
        device_id: &str,
        active_since: f64,
    ) -> Result<Option<OpenSession>, StorageError>;

    /// Insert samples atomically: all rows or none.
    async fn insert_samples(&self, session_id: &str, samples: &[Sample])
        -> Result<usize, StorageError>;

    /// Upsert aggregate rows atomically, overwriting rows with the same key.
    async fn upsert_aggregates(&self, aggregates: &[Aggregate]) -> Result<usize, StorageError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError>;

    async fn list_sessions(&self, filter: &SessionFilter)
        -> Result<Vec<SessionSummary>, StorageError>;

    async fn session_stats(&self, session_id: &str) -> Result<SessionStats, StorageError>;

    /// Samples ordered by timestamp.
    async fn session_samples(
        &self,
        session_id: &str,
        range: SampleRange,
    ) -> Result<Vec<Sample>, StorageError>;

    /// Timestamp of the newest persisted sample of a session.
    async fn last_sample_timestamp(&self, session_id: &str) -> Result<Option<f64>, StorageError>;

    /// Aggregates of one width ordered by interval start.
    async fn aggregates(
        &self,
        session_id: &str,
        interval_width: u32,
    ) -> Result<Vec<Aggregate>, StorageError>;
}

/// Thread-safe shared store handle.
pub type SharedStore = Arc<dyn Store>;
