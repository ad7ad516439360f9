//! Batch persistence with bounded retry, and aggregate recomputation.

use super::{SampleRange, SharedStore, StorageError};
use crate::core::aggregate::compute_buckets;
use crate::core::sample::Sample;
use crate::retry::RetryPolicy;

/// Result of one batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Every sample of the batch was committed
    Written(usize),
    /// The batch was abandoned after `attempts` tries; nothing was committed
    Dropped { samples: usize, attempts: u32 },
}

impl WriteOutcome {
    /// Rows committed by this batch.
    pub fn written(self) -> usize {
        match self {
            WriteOutcome::Written(count) => count,
            WriteOutcome::Dropped { .. } => 0,
        }
    }

    pub fn is_dropped(self) -> bool {
        matches!(self, WriteOutcome::Dropped { .. })
    }
}

/// Writes buffered batches to a [`Store`](super::Store).
#[derive(Clone)]
pub struct StorageWriter {
    store: SharedStore,
    retry: RetryPolicy,
}

impl StorageWriter {
    pub fn new(store: SharedStore, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry: retry.normalized(),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Persist one session's batch atomically.
    ///
    /// Transient failures retry the whole batch with backoff. When attempts
    /// run out, or the failure is not transient, the batch is logged and
    /// dropped; it is never handed back to the buffer.
    pub async fn batch_write(&self, session_id: &str, samples: Vec<Sample>) -> WriteOutcome {
        if samples.is_empty() {
            return WriteOutcome::Written(0);
        }

        let mut attempt = 1_u32;
        loop {
            match self.store.insert_samples(session_id, &samples).await {
                Ok(count) => {
                    tracing::debug!(session_id, count, attempt, "batch written");
                    return WriteOutcome::Written(count);
                }
                Err(error) => {
                    if !error.is_transient() || attempt >= self.retry.max_attempts {
                        tracing::error!(
                            session_id,
                            samples = samples.len(),
                            attempts = attempt,
                            error = %error,
                            "dropping sample batch after failed write"
                        );
                        return WriteOutcome::Dropped {
                            samples: samples.len(),
                            attempts: attempt,
                        };
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        session_id,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying sample batch after transient failure"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Recompute every bucket of `interval_width` seconds over the session's
    /// persisted history. Returns the number of buckets upserted.
    pub async fn compute_aggregates(
        &self,
        session_id: &str,
        interval_width: u32,
    ) -> Result<usize, StorageError> {
        let samples = self
            .store
            .session_samples(session_id, SampleRange::default())
            .await?;
        let buckets = compute_buckets(session_id, &samples, interval_width);
        let count = self.store.upsert_aggregates(&buckets).await?;
        tracing::debug!(session_id, interval_width, buckets = count, "aggregates updated");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use crate::storage::{LibsqlStore, SessionRecord, Store};
    use std::sync::Arc;
    use std::time::Duration;

    async fn writer_with_session(session_id: &str) -> StorageWriter {
        let store = LibsqlStore::open_in_memory().await.expect("open");
        store
            .create_session(&SessionRecord {
                session_id: session_id.to_owned(),
                device_id: "D1".to_owned(),
                device_name: None,
                start_time: 0.0,
                end_time: None,
            })
            .await
            .unwrap();
        let retry = RetryPolicy {
            max_attempts: 2,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(1)),
        };
        StorageWriter::new(Arc::new(store), retry)
    }

    #[tokio::test]
    async fn test_batch_write_counts_rows() {
        let writer = writer_with_session("s1").await;
        let batch = vec![Sample::at(0.0).with_heart_rate(70), Sample::at(1.0)];
        assert_eq!(writer.batch_write("s1", batch).await, WriteOutcome::Written(2));
        assert_eq!(writer.batch_write("s1", Vec::new()).await.written(), 0);
    }

    #[tokio::test]
    async fn test_batch_for_unknown_session_is_dropped() {
        // Foreign key violation: not transient, so no retries.
        let writer = writer_with_session("s1").await;
        let outcome = writer
            .batch_write("missing", vec![Sample::at(0.0).with_heart_rate(70)])
            .await;
        assert_eq!(
            outcome,
            WriteOutcome::Dropped {
                samples: 1,
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_compute_aggregates_is_idempotent() {
        let writer = writer_with_session("s1").await;
        let batch: Vec<Sample> = (0..65)
            .map(|i| Sample::at(i as f64).with_heart_rate(100 + i % 5))
            .collect();
        writer.batch_write("s1", batch).await;

        assert_eq!(writer.compute_aggregates("s1", 30).await.unwrap(), 3);
        let first = writer.store().aggregates("s1", 30).await.unwrap();
        assert_eq!(writer.compute_aggregates("s1", 30).await.unwrap(), 3);
        let second = writer.store().aggregates("s1", 30).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }
}
