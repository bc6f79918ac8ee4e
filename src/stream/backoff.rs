//! Reconnection policy with exponential backoff.
//!
//! The delay schedule is deterministic: the first retry waits the base
//! delay, each further retry doubles it, capped at the maximum. The
//! initial connect attempt of a reconnect cycle is immediate.

use std::time::Duration;

/// Reconnection behavior for a stream connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum connect attempts per reconnect cycle (default: 5)
    pub max_attempts: u32,
    /// Delay before the first retry (default: 1s)
    pub base_delay: Duration,
    /// Cap on the retry delay (default: 60s)
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after the failure with the given 0-based index.
    ///
    /// `min(base * 2^failure_index, max)`. Saturates instead of
    /// overflowing for large indices.
    pub fn delay_after_failure(&self, failure_index: u32) -> Duration {
        backoff_delay(failure_index, self.base_delay, self.max_delay)
    }
}

/// Calculate an exponential backoff delay.
///
/// # Arguments
/// - `failure_index`: 0-based count of failures so far
/// - `base`: delay after the first failure
/// - `max`: delay cap
pub fn backoff_delay(failure_index: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u64.checked_shl(failure_index).unwrap_or(u64::MAX);
    let delay = base
        .checked_mul(factor.min(u32::MAX as u64) as u32)
        .unwrap_or(max);
    delay.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);

        assert_eq!(backoff_delay(0, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(8));
        assert_eq!(backoff_delay(4, base, max), Duration::from_secs(16));
        assert_eq!(backoff_delay(5, base, max), Duration::from_secs(32));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);

        // 2^6 = 64s -> capped to 60s
        assert_eq!(backoff_delay(6, base, max), max);
        assert_eq!(backoff_delay(20, base, max), max);
    }

    #[test]
    fn test_backoff_large_index_saturates() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(30);

        // Shifting past 63 bits must not panic or wrap below max
        assert_eq!(backoff_delay(63, base, max), max);
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
    }

    #[test]
    fn test_fractional_base() {
        let base = Duration::from_millis(250);
        let max = Duration::from_secs(60);

        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(500));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(2));
    }
}
