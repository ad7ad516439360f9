//! Per-session write buffers with duplicate and out-of-order rejection.
//!
//! Every session keeps a timestamp watermark (the last accepted timestamp)
//! that survives flushes. A sample at or below the watermark is a replay
//! from the sensor bridge and is dropped silently.

use crate::core::sample::Sample;
use std::collections::{HashMap, VecDeque};

/// Outcome of offering a sample to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Timestamp at or below the session watermark; not enqueued
    Rejected,
    /// Enqueued, buffer not yet full
    Buffered,
    /// Enqueued and the buffer reached capacity
    Ready,
}

impl Offer {
    /// Whether the caller should flush the session now.
    pub fn ready_to_flush(self) -> bool {
        matches!(self, Offer::Ready)
    }

    /// Whether the sample was enqueued.
    pub fn accepted(self) -> bool {
        !matches!(self, Offer::Rejected)
    }
}

#[derive(Debug, Default)]
struct SessionBuffer {
    watermark: Option<f64>,
    pending: VecDeque<Sample>,
}

/// Bounded, ordered holding area for samples awaiting a batch write.
#[derive(Debug)]
pub struct SampleBuffer {
    capacity: usize,
    sessions: HashMap<String, SessionBuffer>,
}

impl SampleBuffer {
    /// Create a buffer that signals a flush every `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: HashMap::new(),
        }
    }

    /// Offer a sample for a session.
    pub fn offer(&mut self, session_id: &str, sample: Sample) -> Offer {
        let capacity = self.capacity;
        let buffer = self.sessions.entry(session_id.to_string()).or_default();

        if let Some(watermark) = buffer.watermark {
            if sample.timestamp <= watermark {
                return Offer::Rejected;
            }
        }
        buffer.watermark = Some(sample.timestamp);

        // A caller that ignores `Ready` must not grow the queue without bound.
        if buffer.pending.len() >= capacity {
            buffer.pending.pop_front();
            tracing::warn!(
                session_id,
                capacity,
                "buffer overflow, dropping oldest pending sample"
            );
        }
        buffer.pending.push_back(sample);

        if buffer.pending.len() >= capacity {
            Offer::Ready
        } else {
            Offer::Buffered
        }
    }

    /// Take every pending sample for one session, keeping its watermark.
    pub fn drain(&mut self, session_id: &str) -> Vec<Sample> {
        self.sessions
            .get_mut(session_id)
            .map(|buffer| buffer.pending.drain(..).collect())
            .unwrap_or_default()
    }

    /// Take every non-empty buffer.
    pub fn drain_all(&mut self) -> HashMap<String, Vec<Sample>> {
        self.sessions
            .iter_mut()
            .filter(|(_, buffer)| !buffer.pending.is_empty())
            .map(|(session_id, buffer)| (session_id.clone(), buffer.pending.drain(..).collect()))
            .collect()
    }

    /// Drop all state for a closed session, returning what was still pending.
    pub fn release(&mut self, session_id: &str) -> Vec<Sample> {
        self.sessions
            .remove(session_id)
            .map(|buffer| buffer.pending.into_iter().collect())
            .unwrap_or_default()
    }

    /// Raise a session's watermark (used when resuming a persisted session).
    ///
    /// Never lowers an existing watermark.
    pub fn seed_watermark(&mut self, session_id: &str, timestamp: f64) {
        let buffer = self.sessions.entry(session_id.to_string()).or_default();
        match buffer.watermark {
            Some(current) if current >= timestamp => {}
            _ => buffer.watermark = Some(timestamp),
        }
    }

    /// Last accepted timestamp for a session.
    pub fn watermark(&self, session_id: &str) -> Option<f64> {
        self.sessions.get(session_id).and_then(|b| b.watermark)
    }

    /// Number of samples waiting for a session.
    pub fn pending_len(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|b| b.pending.len())
            .unwrap_or(0)
    }

    /// Number of samples waiting across all sessions.
    pub fn total_pending(&self) -> usize {
        self.sessions.values().map(|b| b.pending.len()).sum()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increasing_timestamps_all_accepted() {
        let mut buffer = SampleBuffer::new(5);
        for i in 0..4 {
            assert_eq!(buffer.offer("s1", Sample::at(i as f64)), Offer::Buffered);
        }
        assert_eq!(buffer.offer("s1", Sample::at(4.0)), Offer::Ready);
        assert_eq!(buffer.pending_len("s1"), 5);
    }

    #[test]
    fn test_replay_rejected_without_growth() {
        let mut buffer = SampleBuffer::new(10);
        buffer.offer("s1", Sample::at(5.0));
        buffer.offer("s1", Sample::at(6.0));

        assert_eq!(buffer.offer("s1", Sample::at(6.0)), Offer::Rejected);
        assert_eq!(buffer.offer("s1", Sample::at(3.0)), Offer::Rejected);
        assert_eq!(buffer.pending_len("s1"), 2);
        assert_eq!(buffer.watermark("s1"), Some(6.0));
    }

    #[test]
    fn test_watermark_survives_drain() {
        let mut buffer = SampleBuffer::new(10);
        buffer.offer("s1", Sample::at(1.0));
        buffer.offer("s1", Sample::at(2.0));

        let drained = buffer.drain("s1");
        assert_eq!(drained.len(), 2);
        assert_eq!(buffer.pending_len("s1"), 0);

        assert_eq!(buffer.offer("s1", Sample::at(2.0)), Offer::Rejected);
        assert_eq!(buffer.offer("s1", Sample::at(2.5)), Offer::Buffered);
    }

    #[test]
    fn test_first_sample_at_zero_is_accepted() {
        let mut buffer = SampleBuffer::new(2);
        assert!(buffer.offer("s1", Sample::at(0.0)).accepted());
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut buffer = SampleBuffer::new(10);
        buffer.offer("a", Sample::at(10.0));
        assert_eq!(buffer.offer("b", Sample::at(1.0)), Offer::Buffered);
    }

    #[test]
    fn test_drain_all_skips_empty() {
        let mut buffer = SampleBuffer::new(10);
        buffer.offer("a", Sample::at(1.0));
        buffer.offer("b", Sample::at(1.0));
        buffer.drain("b");

        let all = buffer.drain_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all["a"].len(), 1);
        assert_eq!(buffer.total_pending(), 0);
    }

    #[test]
    fn test_seed_watermark_only_raises() {
        let mut buffer = SampleBuffer::new(10);
        buffer.seed_watermark("s1", 50.0);
        assert_eq!(buffer.offer("s1", Sample::at(49.0)), Offer::Rejected);
        buffer.seed_watermark("s1", 10.0);
        assert_eq!(buffer.watermark("s1"), Some(50.0));
    }

    #[test]
    fn test_release_forgets_session() {
        let mut buffer = SampleBuffer::new(10);
        buffer.offer("s1", Sample::at(1.0));
        let pending = buffer.release("s1");
        assert_eq!(pending.len(), 1);
        assert_eq!(buffer.watermark("s1"), None);
    }
}
