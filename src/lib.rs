//! HRM Logger - session-aware heart rate monitor logging.
//!
//! This library turns a stream of sensor frames from a heart rate monitor
//! bridge into durable, deduplicated sessions in a local SQLite database.
//!
//! # Guarantees
//!
//! - **One open session per device**: a device's samples belong to exactly one
//!   session until it goes quiet for longer than the activity gap
//! - **No duplicates**: samples at or below a session's watermark are dropped,
//!   including replays across a restart
//! - **Bounded loss**: a batch that cannot be written after the retry budget is
//!   logged and dropped; ingestion never stalls on storage
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          HRM Logger                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │  WsSource   │──▶│   Decode    │──▶│  Validate   │         │
//! │  │ (reconnect) │   │  (frames)   │   │  (ranges)   │         │
//! │  └─────────────┘   └─────────────┘   └──────┬──────┘         │
//! │                                             ▼                │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │   Storage   │◀──│   Buffer    │◀──│  Sessions   │         │
//! │  │  (libsql)   │   │  (dedup)    │   │  (gap 5m)   │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │         ▲                                                    │
//! │  ┌──────┴──────┐                                             │
//! │  │ Maintenance │  flush, close idle sessions, aggregates     │
//! │  └─────────────┘                                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use hrm_logger::{ingest::decode_frame, Pipeline, PipelineConfig};
//! use hrm_logger::{create_shared_stats, LibsqlStore, StorageWriter, SystemClock};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let store = Arc::new(LibsqlStore::open_in_memory().await?);
//! let writer = StorageWriter::new(store, Default::default());
//! let pipeline = Pipeline::new(
//!     writer,
//!     PipelineConfig::default(),
//!     Arc::new(SystemClock),
//!     create_shared_stats(),
//! );
//!
//! let frame = decode_frame(r#"{"device_id":"D1","ts_unix_s":1.0,"hr_bpm":72}"#, 1.0)?;
//! pipeline.handle_frame(frame).await;
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod core;
pub mod ingest;
pub mod pipeline;
pub mod retry;
pub mod stats;
pub mod storage;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{Config, ConfigError};
pub use core::{Sample, SampleBuffer, SessionManager, ValidationError};
pub use ingest::{DecodeError, Frame, WsSource};
pub use pipeline::{FrameOutcome, Pipeline, PipelineConfig, ShutdownReport, TickReport};
pub use retry::{Backoff, RetryPolicy};
pub use stats::{create_shared_stats, IngestStats, LivenessTracker, SharedIngestStats};
pub use storage::{LibsqlStore, SharedStore, StorageError, StorageWriter, Store, WriteOutcome};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
