//! Acknowledgment timeout schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff for unacknowledged messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Timeout after the first transmission.
    pub base: Duration,
    /// Ceiling for the backed-off timeout.
    pub max: Duration,
    /// Transmissions per message, the first one included.
    pub max_attempts: u8,
}

impl RetryPolicy {
    /// Timeout to arm after a message has been re-sent `attempts` times:
    /// `base << attempts`, capped at `max`.
    pub fn timeout_for(&self, attempts: u8) -> Duration {
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max.as_millis().min(u64::MAX as u128) as u64;
        let backed_off = base_ms.saturating_mul(1u64.checked_shl(attempts as u32).unwrap_or(u64::MAX));
        Duration::from_millis(backed_off.min(max_ms))
    }

    /// Whether a message that has timed out `attempts` times (after the
    /// increment) may still be re-sent.
    pub fn may_retry(&self, attempts: u8) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        crate::config::RetrySettings::default().policy()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_exponential_schedule_is_capped() {
        let policy = RetryPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(5_000),
            max_attempts: 5,
        };
        let schedule: Vec<u64> = (0..=6)
            .map(|attempt| policy.timeout_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(schedule, vec![100, 200, 400, 800, 1600, 3200, 5000]);
    }

    #[test]
    fn test_overflow_safety_high_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout_for(64), policy.max);
        assert_eq!(policy.timeout_for(u8::MAX), policy.max);
    }

    #[test]
    fn test_may_retry_until_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.may_retry(1));
        assert!(policy.may_retry(2));
        assert!(!policy.may_retry(3));
    }
}
