//! End-to-end tests of the ingestion pipeline against an in-memory database.

use async_trait::async_trait;
use hrm_logger::core::{Aggregate, Sample};
use hrm_logger::ingest::{decode_frame, Frame};
use hrm_logger::pipeline::{FrameOutcome, Pipeline, PipelineConfig};
use hrm_logger::retry::{Backoff, RetryPolicy};
use hrm_logger::stats::create_shared_stats;
use hrm_logger::storage::{
    LibsqlStore, OpenSession, SampleRange, SessionFilter, SessionRecord, SessionStats,
    SessionSummary, SharedStore, StorageError, StorageWriter, Store, WriteOutcome,
};
use hrm_logger::ManualClock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
    }
}

fn config(buffer_size: usize) -> PipelineConfig {
    PipelineConfig {
        buffer_size,
        gap_seconds: 300.0,
        tick_interval: Duration::from_millis(20),
        aggregate_interval: 30,
        status_every: 0,
    }
}

fn pipeline_over(store: SharedStore, clock: Arc<ManualClock>, buffer_size: usize) -> Pipeline {
    let writer = StorageWriter::new(store, fast_retry(3));
    Pipeline::new(writer, config(buffer_size), clock, create_shared_stats())
}

async fn memory_store() -> SharedStore {
    Arc::new(LibsqlStore::open_in_memory().await.expect("open store"))
}

/// Decode a sample frame that arrives at `ts`.
fn sample(device_id: &str, ts: f64, hr: i32) -> Frame {
    let json = format!(r#"{{"device_id":"{device_id}","ts_unix_s":{ts},"hr_bpm":{hr}}}"#);
    decode_frame(&json, ts).expect("decode sample")
}

/// Feed a sample with the clock set to its timestamp.
async fn feed(
    pipeline: &Pipeline,
    clock: &ManualClock,
    device_id: &str,
    ts: f64,
    hr: i32,
) -> FrameOutcome {
    clock.set(ts);
    pipeline.handle_frame(sample(device_id, ts, hr)).await
}

fn session_of(outcome: &FrameOutcome) -> String {
    match outcome {
        FrameOutcome::Accepted { session_id, .. } | FrameOutcome::Duplicate { session_id } => {
            session_id.clone()
        }
        other => panic!("expected a session outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_buffer_flushes_at_capacity() {
    let store = memory_store().await;
    let clock = Arc::new(ManualClock::new(0.0));
    let pipeline = pipeline_over(Arc::clone(&store), Arc::clone(&clock), 2);

    let first = feed(&pipeline, &clock, "D1", 0.0, 70).await;
    let second = feed(&pipeline, &clock, "D1", 1.0, 72).await;
    let third = feed(&pipeline, &clock, "D1", 2.0, 71).await;

    let session_id = session_of(&first);
    assert_eq!(session_of(&second), session_id);
    assert_eq!(session_of(&third), session_id);

    assert!(matches!(first, FrameOutcome::Accepted { flushed: None, .. }));
    assert!(matches!(
        second,
        FrameOutcome::Accepted {
            flushed: Some(WriteOutcome::Written(2)),
            ..
        }
    ));
    assert!(matches!(third, FrameOutcome::Accepted { flushed: None, .. }));

    let stats = store.session_stats(&session_id).await.unwrap();
    assert_eq!(stats.sample_count, 2);
    assert_eq!(pipeline.pending(&session_id).await, 1);

    let report = pipeline.shutdown().await;
    assert_eq!(report.rows_written, 1);
    assert_eq!(report.sessions_closed, 1);

    let stats = store.session_stats(&session_id).await.unwrap();
    assert_eq!(stats.sample_count, 3);
    assert_eq!(stats.min_hr, Some(70));
    assert_eq!(stats.max_hr, Some(72));
}

#[tokio::test]
async fn test_gap_splits_sessions_at_last_activity() {
    let store = memory_store().await;
    let clock = Arc::new(ManualClock::new(0.0));
    let pipeline = pipeline_over(Arc::clone(&store), Arc::clone(&clock), 30);

    let first = session_of(&feed(&pipeline, &clock, "D1", 0.0, 70).await);
    let second = session_of(&feed(&pipeline, &clock, "D1", 301.0, 75).await);
    assert_ne!(first, second);

    let closed = store.get_session(&first).await.unwrap().unwrap();
    assert_eq!(closed.end_time, Some(0.0));
    // The closed session's buffered sample was written on closure.
    assert_eq!(store.session_stats(&first).await.unwrap().sample_count, 1);

    let open = store.get_session(&second).await.unwrap().unwrap();
    assert_eq!(open.start_time, 301.0);
    assert_eq!(open.end_time, None);
}

#[tokio::test]
async fn test_sample_at_gap_boundary_continues_session() {
    let store = memory_store().await;
    let clock = Arc::new(ManualClock::new(0.0));
    let pipeline = pipeline_over(store, Arc::clone(&clock), 30);

    let first = session_of(&feed(&pipeline, &clock, "D1", 0.0, 70).await);
    let second = session_of(&feed(&pipeline, &clock, "D1", 300.0, 70).await);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_duplicates_are_rejected() {
    let store = memory_store().await;
    let clock = Arc::new(ManualClock::new(0.0));
    let pipeline = pipeline_over(Arc::clone(&store), Arc::clone(&clock), 30);

    let session_id = session_of(&feed(&pipeline, &clock, "D1", 5.0, 70).await);
    for ts in [5.0, 4.0] {
        clock.set(6.0);
        let outcome = pipeline.handle_frame(sample("D1", ts, 70)).await;
        assert_eq!(
            outcome,
            FrameOutcome::Duplicate {
                session_id: session_id.clone()
            }
        );
    }
    assert_eq!(pipeline.pending(&session_id).await, 1);
    assert_eq!(pipeline.stats().snapshot().duplicates_dropped, 2);

    pipeline.shutdown().await;
    assert_eq!(store.session_stats(&session_id).await.unwrap().sample_count, 1);
}

#[tokio::test]
async fn test_devices_get_independent_sessions() {
    let store = memory_store().await;
    let clock = Arc::new(ManualClock::new(0.0));
    let pipeline = pipeline_over(store, Arc::clone(&clock), 30);

    let d1 = session_of(&feed(&pipeline, &clock, "D1", 0.0, 70).await);
    let d2 = session_of(&feed(&pipeline, &clock, "D2", 0.0, 90).await);
    assert_ne!(d1, d2);
    assert_eq!(pipeline.session_for("D1").await, Some(d1));
    assert_eq!(pipeline.session_for("D2").await, Some(d2));
    assert_eq!(pipeline.active_sessions().await.len(), 2);
}

#[tokio::test]
async fn test_heartbeats_and_invalid_samples_never_reach_storage() {
    let store = memory_store().await;
    let clock = Arc::new(ManualClock::new(10.0));
    let pipeline = pipeline_over(Arc::clone(&store), Arc::clone(&clock), 30);

    let heartbeat = decode_frame(
        r#"{"device_id":"D1","heartbeat":true,"battery_pct":80,"connection_attempts":2}"#,
        10.0,
    )
    .unwrap();
    assert_eq!(pipeline.handle_frame(heartbeat).await, FrameOutcome::Heartbeat);
    assert!(pipeline.session_for("D1").await.is_none());

    let invalid = feed(&pipeline, &clock, "D1", 11.0, 251).await;
    assert!(matches!(invalid, FrameOutcome::Invalid(_)));
    assert!(pipeline.session_for("D1").await.is_none());

    let snapshot = pipeline.stats().snapshot();
    assert_eq!(snapshot.heartbeats, 1);
    assert_eq!(snapshot.records_processed, 1);
    assert_eq!(snapshot.failed_records, 1);

    let liveness = pipeline.liveness().device("D1").unwrap();
    assert_eq!(liveness.heartbeats, 1);

    let sessions = store.list_sessions(&SessionFilter::default()).await.unwrap();
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn test_tick_flushes_sweeps_and_aggregates() {
    let store = memory_store().await;
    let clock = Arc::new(ManualClock::new(0.0));
    let pipeline = pipeline_over(Arc::clone(&store), Arc::clone(&clock), 100);

    let mut session_id = String::new();
    for i in 0..40 {
        session_id = session_of(&feed(&pipeline, &clock, "D1", f64::from(i), 100 + i).await);
    }

    let report = pipeline.tick().await;
    assert_eq!(report.rows_written, 40);
    assert_eq!(report.sessions_closed, 0);
    assert_eq!(report.aggregates_written, 2);
    assert_eq!(store.aggregates(&session_id, 30).await.unwrap().len(), 2);

    // Idle past the gap: the next tick closes the session at its last sample.
    clock.set(39.0 + 301.0);
    let report = pipeline.tick().await;
    assert_eq!(report.sessions_closed, 1);
    assert!(pipeline.active_sessions().await.is_empty());

    let closed = store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(closed.end_time, Some(39.0));

    // Recomputing leaves the same rows.
    let before = store.aggregates(&session_id, 30).await.unwrap();
    pipeline.tick().await;
    assert_eq!(store.aggregates(&session_id, 30).await.unwrap(), before);
}

#[tokio::test]
async fn test_restart_adopts_session_and_rejects_replay() {
    let store = memory_store().await;
    let clock = Arc::new(ManualClock::new(0.0));

    let session_id = {
        let before_crash = pipeline_over(Arc::clone(&store), Arc::clone(&clock), 2);
        feed(&before_crash, &clock, "D1", 0.0, 70).await;
        session_of(&feed(&before_crash, &clock, "D1", 1.0, 71).await)
        // Dropped without shutdown: the session stays open in storage.
    };

    let after_restart = pipeline_over(Arc::clone(&store), Arc::clone(&clock), 2);
    clock.set(10.0);
    let replay = after_restart.handle_frame(sample("D1", 1.0, 71)).await;
    assert_eq!(
        replay,
        FrameOutcome::Duplicate {
            session_id: session_id.clone()
        }
    );

    let fresh = feed(&after_restart, &clock, "D1", 11.0, 72).await;
    assert_eq!(session_of(&fresh), session_id);
    assert_eq!(after_restart.stats().snapshot().sessions_created, 0);
}

#[tokio::test]
async fn test_run_stops_on_shutdown_signal() {
    let store = memory_store().await;
    let clock = Arc::new(ManualClock::new(0.0));
    let pipeline = Arc::new(pipeline_over(Arc::clone(&store), Arc::clone(&clock), 30));

    let (frame_tx, frame_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(Arc::clone(&pipeline).run(frame_rx, shutdown_rx));

    clock.set(4.0);
    for i in 0..5 {
        frame_tx.send(sample("D1", f64::from(i), 80)).await.unwrap();
    }
    // Let the loop drain the channel.
    while pipeline.stats().snapshot().records_processed < 5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shutdown_tx.send(true).unwrap();
    let report = running.await.unwrap();
    assert_eq!(report.sessions_closed, 1);

    let sessions = store.list_sessions(&SessionFilter::default()).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].sample_count, 5);
    assert_eq!(sessions[0].session.end_time, Some(4.0));
}

/// Store whose sample inserts fail with lock contention a fixed number of
/// times, and whose aggregate writes fail for one chosen session.
struct FlakyStore {
    inner: LibsqlStore,
    failures_left: AtomicU32,
    broken_aggregates: Mutex<Option<String>>,
}

impl FlakyStore {
    fn break_aggregates_of(&self, session_id: &str) {
        *self.broken_aggregates.lock().unwrap() = Some(session_id.to_string());
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn create_session(&self, session: &SessionRecord) -> Result<(), StorageError> {
        self.inner.create_session(session).await
    }

    async fn close_session(&self, session_id: &str, end_time: f64) -> Result<bool, StorageError> {
        self.inner.close_session(session_id, end_time).await
    }

    async fn find_open_session(
        &self,
        device_id: &str,
        active_since: f64,
    ) -> Result<Option<OpenSession>, StorageError> {
        self.inner.find_open_session(device_id, active_since).await
    }

    async fn insert_samples(
        &self,
        session_id: &str,
        samples: &[Sample],
    ) -> Result<usize, StorageError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Busy {
                message: "database is locked".to_string(),
            });
        }
        self.inner.insert_samples(session_id, samples).await
    }

    async fn upsert_aggregates(&self, aggregates: &[Aggregate]) -> Result<usize, StorageError> {
        let broken = self.broken_aggregates.lock().unwrap().clone();
        if let Some(broken) = broken {
            if aggregates.iter().any(|a| a.session_id == broken) {
                return Err(StorageError::Query {
                    message: "disk I/O error".to_string(),
                });
            }
        }
        self.inner.upsert_aggregates(aggregates).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        self.inner.get_session(session_id).await
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionSummary>, StorageError> {
        self.inner.list_sessions(filter).await
    }

    async fn session_stats(&self, session_id: &str) -> Result<SessionStats, StorageError> {
        self.inner.session_stats(session_id).await
    }

    async fn session_samples(
        &self,
        session_id: &str,
        range: SampleRange,
    ) -> Result<Vec<Sample>, StorageError> {
        self.inner.session_samples(session_id, range).await
    }

    async fn last_sample_timestamp(&self, session_id: &str) -> Result<Option<f64>, StorageError> {
        self.inner.last_sample_timestamp(session_id).await
    }

    async fn aggregates(
        &self,
        session_id: &str,
        interval_width: u32,
    ) -> Result<Vec<Aggregate>, StorageError> {
        self.inner.aggregates(session_id, interval_width).await
    }
}

async fn flaky_store(failures: u32) -> Arc<FlakyStore> {
    Arc::new(FlakyStore {
        inner: LibsqlStore::open_in_memory().await.expect("open store"),
        failures_left: AtomicU32::new(failures),
        broken_aggregates: Mutex::new(None),
    })
}

#[tokio::test]
async fn test_transient_write_failure_is_retried() {
    let store = flaky_store(2).await;
    let clock = Arc::new(ManualClock::new(0.0));
    let pipeline = pipeline_over(store.clone(), Arc::clone(&clock), 2);

    feed(&pipeline, &clock, "D1", 0.0, 70).await;
    let outcome = feed(&pipeline, &clock, "D1", 1.0, 71).await;
    assert!(matches!(
        outcome,
        FrameOutcome::Accepted {
            flushed: Some(WriteOutcome::Written(2)),
            ..
        }
    ));
}

#[tokio::test]
async fn test_exhausted_retries_drop_batch_and_continue() {
    let store = flaky_store(3).await;
    let clock = Arc::new(ManualClock::new(0.0));
    let pipeline = pipeline_over(store.clone(), Arc::clone(&clock), 2);

    feed(&pipeline, &clock, "D1", 0.0, 70).await;
    let dropped = feed(&pipeline, &clock, "D1", 1.0, 71).await;
    let session_id = session_of(&dropped);
    assert!(matches!(
        dropped,
        FrameOutcome::Accepted {
            flushed: Some(WriteOutcome::Dropped {
                samples: 2,
                attempts: 3
            }),
            ..
        }
    ));
    // Dropped samples are not re-enqueued; later ones still flow.
    assert_eq!(pipeline.pending(&session_id).await, 0);

    feed(&pipeline, &clock, "D1", 2.0, 72).await;
    let written = feed(&pipeline, &clock, "D1", 3.0, 73).await;
    assert!(matches!(
        written,
        FrameOutcome::Accepted {
            flushed: Some(WriteOutcome::Written(2)),
            ..
        }
    ));
    assert_eq!(store.session_stats(&session_id).await.unwrap().sample_count, 2);
    assert_eq!(pipeline.stats().snapshot().batches_dropped, 1);
}

#[tokio::test]
async fn test_aggregate_failure_is_isolated_per_session() {
    let store = flaky_store(0).await;
    let clock = Arc::new(ManualClock::new(0.0));
    let pipeline = pipeline_over(store.clone(), Arc::clone(&clock), 100);

    let mut d1 = String::new();
    let mut d2 = String::new();
    for i in 0..10 {
        d1 = session_of(&feed(&pipeline, &clock, "D1", f64::from(i), 80).await);
        d2 = session_of(&feed(&pipeline, &clock, "D2", f64::from(i), 90).await);
    }
    store.break_aggregates_of(&d1);

    let report = pipeline.tick().await;
    assert_eq!(report.rows_written, 20);
    assert_eq!(report.aggregate_failures, 1);
    assert_eq!(report.aggregates_written, 1);

    assert!(store.aggregates(&d1, 30).await.unwrap().is_empty());
    let healthy = store.aggregates(&d2, 30).await.unwrap();
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0].sample_count, 10);
    assert_eq!(healthy[0].avg_hr, 90.0);
}

#[tokio::test]
async fn test_fractional_out_of_range_readings_are_dropped() {
    let store = memory_store().await;
    let clock = Arc::new(ManualClock::new(1.0));
    let pipeline = pipeline_over(Arc::clone(&store), Arc::clone(&clock), 30);

    for json in [
        r#"{"device_id":"D1","ts_unix_s":1,"hr_bpm":29.6}"#,
        r#"{"device_id":"D1","ts_unix_s":1,"hr_bpm":29.5}"#,
        r#"{"device_id":"D1","ts_unix_s":1,"hr_bpm":250.4}"#,
        r#"{"device_id":"D1","ts_unix_s":1,"hr_bpm":120,"cadence_spm":300.4}"#,
    ] {
        let frame = decode_frame(json, 1.0).unwrap();
        assert!(
            matches!(pipeline.handle_frame(frame).await, FrameOutcome::Invalid(_)),
            "{json} should be rejected"
        );
    }
    assert!(pipeline.session_for("D1").await.is_none());
    assert_eq!(pipeline.stats().snapshot().failed_records, 4);

    clock.set(2.0);
    let json = r#"{"device_id":"D1","ts_unix_s":2,"hr_bpm":249.6}"#;
    let frame = decode_frame(json, 2.0).unwrap();
    assert!(matches!(
        pipeline.handle_frame(frame).await,
        FrameOutcome::Accepted { .. }
    ));
}
