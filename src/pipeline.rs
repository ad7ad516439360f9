//! Ingestion pipeline and periodic maintenance.
//!
//! One ingestion task pulls decoded frames off a channel; one maintenance task
//! ticks on a fixed interval. Both mutate the same session map and buffers,
//! which live behind a single async mutex (`state`).
//!
//! Writes happen outside `state` but under `flush_lock`, which is always
//! taken while `state` is still held. A batch drained before a closure is
//! therefore written before that closure's final aggregates are computed.

use crate::clock::SharedClock;
use crate::core::buffer::{Offer, SampleBuffer};
use crate::core::sample::Sample;
use crate::core::session::{ClosedSession, SessionManager, SessionOrigin};
use crate::core::validate::{validate_readings, ValidationError};
use crate::ingest::frame::{Frame, SampleFrame};
use crate::stats::{LivenessTracker, SharedIngestStats};
use crate::storage::{StorageWriter, WriteOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};

/// Tunables of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Samples per session before a flush
    pub buffer_size: usize,
    /// Inactivity gap closing a session, seconds
    pub gap_seconds: f64,
    pub tick_interval: Duration,
    /// Aggregate bucket width, seconds
    pub aggregate_interval: u32,
    /// Log a status line every N processed records (0 disables)
    pub status_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 30,
            gap_seconds: 300.0,
            tick_interval: Duration::from_secs(30),
            aggregate_interval: 30,
            status_every: 50,
        }
    }
}

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Liveness only; never reaches sessions or buffers
    Heartbeat,
    Invalid(ValidationError),
    /// At or below the session watermark
    Duplicate { session_id: String },
    Accepted {
        session_id: String,
        /// Set when this sample filled the buffer and triggered a write
        flushed: Option<WriteOutcome>,
    },
    /// Session could not be resolved (storage failure); sample dropped
    Unresolved,
}

/// Totals from one maintenance tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub sessions_closed: usize,
    pub rows_written: usize,
    pub batches_dropped: usize,
    pub aggregates_written: usize,
    pub aggregate_failures: usize,
}

/// Totals from shutdown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    pub rows_written: usize,
    pub batches_dropped: usize,
    pub sessions_closed: usize,
}

struct CoreState {
    sessions: SessionManager,
    buffer: SampleBuffer,
}

/// Pending writes collected under the state lock.
#[derive(Default)]
struct FlushPlan {
    batches: Vec<(String, Vec<Sample>)>,
    closed: Vec<ClosedSession>,
}

#[derive(Default)]
struct FlushTotals {
    rows_written: usize,
    batches_dropped: usize,
    aggregates_written: usize,
    aggregate_failures: usize,
}

pub struct Pipeline {
    state: Mutex<CoreState>,
    flush_lock: Mutex<()>,
    writer: StorageWriter,
    clock: SharedClock,
    stats: SharedIngestStats,
    liveness: Arc<LivenessTracker>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        writer: StorageWriter,
        config: PipelineConfig,
        clock: SharedClock,
        stats: SharedIngestStats,
    ) -> Self {
        Self {
            state: Mutex::new(CoreState {
                sessions: SessionManager::new(config.gap_seconds),
                buffer: SampleBuffer::new(config.buffer_size),
            }),
            flush_lock: Mutex::new(()),
            writer,
            clock,
            stats,
            liveness: Arc::new(LivenessTracker::new()),
            config,
        }
    }

    pub fn stats(&self) -> &SharedIngestStats {
        &self.stats
    }

    pub fn liveness(&self) -> &Arc<LivenessTracker> {
        &self.liveness
    }

    pub fn writer(&self) -> &StorageWriter {
        &self.writer
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Route one decoded frame.
    pub async fn handle_frame(&self, frame: Frame) -> FrameOutcome {
        match frame {
            Frame::Heartbeat(heartbeat) => {
                self.stats.record_heartbeat();
                self.liveness.record_heartbeat(&heartbeat);
                tracing::debug!(device_id = %heartbeat.device_id, "heartbeat");
                FrameOutcome::Heartbeat
            }
            Frame::Sample(frame) => self.handle_sample(frame).await,
        }
    }

    async fn handle_sample(&self, frame: SampleFrame) -> FrameOutcome {
        let processed = self.stats.record_processed();
        let SampleFrame {
            device,
            sample,
            readings,
            ..
        } = frame;
        self.liveness
            .record_sample(&device.device_id, sample.timestamp, sample.battery_pct);

        if let Err(reason) = validate_readings(&readings) {
            self.stats.record_failed();
            tracing::debug!(device_id = %device.device_id, reason = %reason, "invalid sample dropped");
            return FrameOutcome::Invalid(reason);
        }

        let arrival = self.clock.now();
        let mut state = self.state.lock().await;
        let CoreState { sessions, buffer } = &mut *state;

        let resolution = match sessions
            .resolve(
                self.writer.store().as_ref(),
                &device.device_id,
                device.device_name.as_deref(),
                arrival,
            )
            .await
        {
            Ok(resolution) => resolution,
            Err(error) => {
                self.stats.record_failed();
                tracing::error!(
                    device_id = %device.device_id,
                    error = %error,
                    "failed to resolve session, dropping sample"
                );
                return FrameOutcome::Unresolved;
            }
        };

        let mut plan = FlushPlan::default();
        if let Some(closed) = resolution.closed {
            let pending = buffer.release(&closed.session_id);
            plan.batches.push((closed.session_id.clone(), pending));
            plan.closed.push(closed);
        }
        match resolution.origin {
            SessionOrigin::Created => self.stats.record_session_created(),
            SessionOrigin::Adopted {
                last_sample_at: Some(last),
            } => buffer.seed_watermark(&resolution.session_id, last),
            _ => {}
        }

        let session_id = resolution.session_id;
        let offer = buffer.offer(&session_id, sample);
        if offer == Offer::Rejected {
            self.stats.record_duplicate();
        }
        let flush_index = offer.ready_to_flush().then(|| {
            plan.batches
                .push((session_id.clone(), buffer.drain(&session_id)));
            plan.batches.len() - 1
        });

        if self.config.status_every > 0 && processed % self.config.status_every == 0 {
            self.log_status(sessions.active_count());
        }

        let (outcomes, _) = self.flush(state, plan).await;
        if offer == Offer::Rejected {
            return FrameOutcome::Duplicate { session_id };
        }
        FrameOutcome::Accepted {
            session_id,
            flushed: flush_index.and_then(|i| outcomes.get(i).copied()),
        }
    }

    /// One maintenance pass: sweep, flush everything, refresh aggregates of
    /// active sessions. A failure on one session never stops the others.
    pub async fn tick(&self) -> TickReport {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let CoreState { sessions, buffer } = &mut *state;

        let mut plan = FlushPlan::default();
        for closed in sessions.sweep(self.writer.store().as_ref(), now).await {
            let pending = buffer.release(&closed.session_id);
            plan.batches.push((closed.session_id.clone(), pending));
            plan.closed.push(closed);
        }
        plan.batches.extend(buffer.drain_all());
        let active = sessions.active_sessions();
        let sessions_closed = plan.closed.len();

        let (_, mut totals) = self.flush(state, plan).await;

        for session_id in active {
            self.refresh_aggregates(&session_id, &mut totals).await;
        }

        TickReport {
            sessions_closed,
            rows_written: totals.rows_written,
            batches_dropped: totals.batches_dropped,
            aggregates_written: totals.aggregates_written,
            aggregate_failures: totals.aggregate_failures,
        }
    }

    /// Drain and write every buffer once, close every open session at its
    /// last activity, compute final aggregates and persist the counters.
    /// Failures are logged; the sequence always runs to the end.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut state = self.state.lock().await;
        let CoreState { sessions, buffer } = &mut *state;

        let mut plan = FlushPlan {
            batches: buffer.drain_all().into_iter().collect(),
            closed: Vec::new(),
        };
        let guard = self.flush_lock.lock().await;
        let mut totals = FlushTotals::default();
        self.write_batches(std::mem::take(&mut plan.batches), &mut totals)
            .await;
        drop(guard);

        plan.closed = sessions.close_all(self.writer.store().as_ref()).await;
        for closed in &plan.closed {
            let leftover = buffer.release(&closed.session_id);
            plan.batches.push((closed.session_id.clone(), leftover));
        }
        let sessions_closed = plan.closed.len();
        let (_, totals_after) = self.flush(state, plan).await;

        if let Err(error) = self.stats.save() {
            tracing::warn!(error = %error, "failed to persist ingest stats");
        }

        ShutdownReport {
            rows_written: totals.rows_written + totals_after.rows_written,
            batches_dropped: totals.batches_dropped + totals_after.batches_dropped,
            sessions_closed,
        }
    }

    /// Consume frames until `shutdown` flips or the channel closes, ticking
    /// maintenance alongside, then run [`Pipeline::shutdown`].
    pub async fn run(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<Frame>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ShutdownReport {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let maintenance = {
            let pipeline = Arc::clone(&self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(pipeline.config.tick_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately.
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let report = pipeline.tick().await;
                            tracing::debug!(?report, "maintenance tick");
                        }
                        _ = stop_rx.changed() => break,
                    }
                }
            })
        };

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    frame = frames.recv() => match frame {
                        Some(frame) => {
                            self.handle_frame(frame).await;
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }
        frames.close();

        let _ = stop_tx.send(true);
        if let Err(error) = maintenance.await {
            tracing::error!(error = %error, "maintenance task failed");
        }

        tracing::info!("shutting down ingestion pipeline");
        self.shutdown().await
    }

    /// Ids of currently open sessions.
    pub async fn active_sessions(&self) -> Vec<String> {
        self.state.lock().await.sessions.active_sessions()
    }

    /// Session currently attributed to `device_id`.
    pub async fn session_for(&self, device_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .sessions
            .session_for(device_id)
            .map(str::to_owned)
    }

    /// Samples waiting in a session's buffer.
    pub async fn pending(&self, session_id: &str) -> usize {
        self.state.lock().await.buffer.pending_len(session_id)
    }

    /// Status block: counters, active sessions and device liveness.
    pub async fn status_report(&self) -> String {
        let active = self.state.lock().await.sessions.active_count();
        format!(
            "{}\n{}",
            self.stats.summary(active),
            self.liveness.summary(self.clock.now())
        )
    }

    fn log_status(&self, active_sessions: usize) {
        let snapshot = self.stats.snapshot();
        tracing::info!(
            records = snapshot.records_processed,
            failed = snapshot.failed_records,
            success_rate = snapshot.success_rate(),
            active_sessions,
            "ingest status"
        );
    }

    /// Write a plan's batches and finalize its closed sessions. The flush
    /// lock is acquired before `state` is released.
    async fn flush(
        &self,
        state: MutexGuard<'_, CoreState>,
        plan: FlushPlan,
    ) -> (Vec<WriteOutcome>, FlushTotals) {
        let mut totals = FlushTotals::default();
        if plan.batches.is_empty() && plan.closed.is_empty() {
            return (Vec::new(), totals);
        }

        let _guard = self.flush_lock.lock().await;
        drop(state);

        let outcomes = self.write_batches(plan.batches, &mut totals).await;
        for closed in &plan.closed {
            self.finalize(closed, &mut totals).await;
        }
        (outcomes, totals)
    }

    async fn write_batches(
        &self,
        batches: Vec<(String, Vec<Sample>)>,
        totals: &mut FlushTotals,
    ) -> Vec<WriteOutcome> {
        let mut outcomes = Vec::with_capacity(batches.len());
        for (session_id, samples) in batches {
            let outcome = self.writer.batch_write(&session_id, samples).await;
            match outcome {
                WriteOutcome::Written(count) => {
                    self.stats.record_rows_written(count as u64);
                    totals.rows_written += count;
                }
                WriteOutcome::Dropped { .. } => {
                    self.stats.record_batch_dropped();
                    totals.batches_dropped += 1;
                }
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn finalize(&self, closed: &ClosedSession, totals: &mut FlushTotals) {
        self.stats.record_sessions_closed(1);
        self.refresh_aggregates(&closed.session_id, totals).await;

        match self.writer.store().session_stats(&closed.session_id).await {
            Ok(stats) => tracing::info!(
                session_id = %closed.session_id,
                device_id = %closed.device_id,
                samples = stats.sample_count,
                avg_hr = stats.avg_hr.unwrap_or(0.0),
                max_hr = stats.max_hr.unwrap_or(0),
                duration_secs = stats.duration_secs().unwrap_or(0.0),
                "final session stats"
            ),
            Err(error) => tracing::warn!(
                session_id = %closed.session_id,
                error = %error,
                "failed to read final session stats"
            ),
        }
    }

    async fn refresh_aggregates(&self, session_id: &str, totals: &mut FlushTotals) {
        match self
            .writer
            .compute_aggregates(session_id, self.config.aggregate_interval)
            .await
        {
            Ok(count) => {
                self.stats.record_aggregates_written(count as u64);
                totals.aggregates_written += count;
            }
            Err(error) => {
                totals.aggregate_failures += 1;
                tracing::error!(session_id, error = %error, "failed to compute aggregates");
            }
        }
    }
}
