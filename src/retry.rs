//! Exponential backoff shared by the storage writer and the WebSocket source.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capped exponential backoff: `base * 2^(attempt - 1)`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "base_ms", with = "duration_ms")]
    pub base: Duration,
    #[serde(rename = "max_ms", with = "duration_ms")]
    pub max: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Reconnect schedule for the ingestion connection: 1s, 2s, 4s ... 30s.
    pub const fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Zero base becomes 1 ms, and `max` never drops below `base`.
    pub fn normalized(self) -> Self {
        let base = if self.base.is_zero() {
            Duration::from_millis(1)
        } else {
            self.base
        };
        let max = self.max.max(base);
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1_u128 << shift;
        let base = self.base.as_millis();
        let max = self.max.as_millis();
        let delay_ms = base.saturating_mul(factor).min(max);
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(2))
    }
}

/// Bounded retry for storage writes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    #[serde(flatten)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn normalized(self) -> Self {
        Self {
            max_attempts: self.max_attempts.max(1),
            backoff: self.backoff.normalized(),
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

/// Serde support for millisecond durations.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff = Backoff::reconnect();
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| backoff.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let backoff = Backoff::reconnect();
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_normalized_policy() {
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff: Backoff::new(Duration::ZERO, Duration::ZERO),
        }
        .normalized();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff.base, Duration::from_millis(1));
        assert_eq!(policy.backoff.max, Duration::from_millis(1));
    }

    #[test]
    fn test_policy_json_shape() {
        let json = serde_json::to_value(RetryPolicy::default()).unwrap();
        assert_eq!(json["max_attempts"], 3);
        assert_eq!(json["base_ms"], 250);
        assert_eq!(json["max_ms"], 2000);
    }
}
