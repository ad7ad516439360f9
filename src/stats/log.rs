//! Ingestion counters.
//!
//! Counts what flowed through the pipeline so the service can print periodic
//! status and a final tally. Counters persist across restarts as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the current process, optionally seeded from disk.
#[derive(Debug)]
pub struct IngestStats {
    /// Sample frames taken off the stream
    records_processed: AtomicU64,
    /// Malformed frames plus samples failing validation
    failed_records: AtomicU64,
    /// Samples rejected by the buffer watermark
    duplicates_dropped: AtomicU64,
    heartbeats: AtomicU64,
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    rows_written: AtomicU64,
    /// Batches abandoned after exhausting write retries
    batches_dropped: AtomicU64,
    aggregates_written: AtomicU64,
    started_at: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            records_processed: AtomicU64::new(0),
            failed_records: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            aggregates_written: AtomicU64::new(0),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Counters backed by a JSON file, loading previous totals if present.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!(error = %e, "could not load previous ingest stats");
        }

        stats
    }

    /// Returns the running total, used for the periodic status cadence.
    pub fn record_processed(&self) -> u64 {
        self.records_processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_failed(&self) {
        self.failed_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sessions_closed(&self, count: u64) {
        self.sessions_closed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rows_written(&self, count: u64) {
        self.rows_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_batch_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggregates_written(&self, count: u64) {
        self.aggregates_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            records_processed: self.records_processed.load(Ordering::Relaxed),
            failed_records: self.failed_records.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            aggregates_written: self.aggregates_written.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Status block printed every N records and at shutdown.
    pub fn summary(&self, active_sessions: usize) -> String {
        let stats = self.snapshot();
        format!(
            "Ingest Statistics:\n\
             - Records processed: {}\n\
             - Failed records: {}\n\
             - Success rate: {:.1}%\n\
             - Duplicates dropped: {}\n\
             - Heartbeats: {}\n\
             - Rows written: {}\n\
             - Batches dropped: {}\n\
             - Sessions created / closed: {} / {}\n\
             - Active sessions: {}\n\
             - Uptime: {} seconds",
            stats.records_processed,
            stats.failed_records,
            stats.success_rate(),
            stats.duplicates_dropped,
            stats.heartbeats,
            stats.rows_written,
            stats.batches_dropped,
            stats.sessions_created,
            stats.sessions_closed,
            active_sessions,
            stats.uptime_secs
        )
    }

    /// Save counters to disk (no-op without a persistence path).
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.snapshot();
            let persisted = PersistedStats {
                records_processed: stats.records_processed,
                failed_records: stats.failed_records,
                duplicates_dropped: stats.duplicates_dropped,
                heartbeats: stats.heartbeats,
                sessions_created: stats.sessions_created,
                sessions_closed: stats.sessions_closed,
                rows_written: stats.rows_written,
                batches_dropped: stats.batches_dropped,
                aggregates_written: stats.aggregates_written,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let persisted = read_persisted(path)?;
                self.records_processed
                    .store(persisted.records_processed, Ordering::Relaxed);
                self.failed_records
                    .store(persisted.failed_records, Ordering::Relaxed);
                self.duplicates_dropped
                    .store(persisted.duplicates_dropped, Ordering::Relaxed);
                self.heartbeats.store(persisted.heartbeats, Ordering::Relaxed);
                self.sessions_created
                    .store(persisted.sessions_created, Ordering::Relaxed);
                self.sessions_closed
                    .store(persisted.sessions_closed, Ordering::Relaxed);
                self.rows_written
                    .store(persisted.rows_written, Ordering::Relaxed);
                self.batches_dropped
                    .store(persisted.batches_dropped, Ordering::Relaxed);
                self.aggregates_written
                    .store(persisted.aggregates_written, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSnapshot {
    pub records_processed: u64,
    pub failed_records: u64,
    pub duplicates_dropped: u64,
    pub heartbeats: u64,
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub rows_written: u64,
    pub batches_dropped: u64,
    pub aggregates_written: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

impl IngestSnapshot {
    /// Share of processed records that were not failures, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.records_processed == 0 {
            return 100.0;
        }
        let ok = self.records_processed.saturating_sub(self.failed_records);
        100.0 * ok as f64 / self.records_processed as f64
    }
}

/// On-disk format.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStats {
    pub records_processed: u64,
    pub failed_records: u64,
    #[serde(default)]
    pub duplicates_dropped: u64,
    #[serde(default)]
    pub heartbeats: u64,
    #[serde(default)]
    pub sessions_created: u64,
    #[serde(default)]
    pub sessions_closed: u64,
    #[serde(default)]
    pub rows_written: u64,
    #[serde(default)]
    pub batches_dropped: u64,
    #[serde(default)]
    pub aggregates_written: u64,
    pub last_updated: DateTime<Utc>,
}

/// Read a persisted stats file without attaching it to live counters.
pub fn read_persisted(path: &std::path::Path) -> Result<PersistedStats, std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(std::io::Error::other)
}

/// Thread-safe shared counters.
pub type SharedIngestStats = Arc<IngestStats>;

pub fn create_shared_stats() -> SharedIngestStats {
    Arc::new(IngestStats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedIngestStats {
    Arc::new(IngestStats::with_persistence(path))
}
