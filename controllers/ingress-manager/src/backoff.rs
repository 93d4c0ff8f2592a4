//! # Requeue Backoff
//!
//! Backoff policies for failed reconciles.
//!
//! The work queue owns the per-key failure count; a policy only maps that
//! count to a delay. The default curve doubles from 5ms per consecutive
//! failure and is capped at 1000s: 5ms, 10ms, 20ms, 40ms, ... 1000s (max).

use std::time::Duration;

/// Maps a key's consecutive-failure count to its next requeue delay.
pub trait BackoffPolicy: Send + Sync + std::fmt::Debug {
    /// Delay before the next attempt, given the failures recorded so far (0-indexed)
    fn delay(&self, failures: u32) -> Duration;
}

/// Exponential backoff calculator
///
/// `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    base: Duration,
    /// Upper bound for any delay
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with the given base and cap
    ///
    /// # Arguments
    ///
    /// * `base` - Delay after the first failure (typically 5ms)
    /// * `max` - Maximum delay (typically 1000s)
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, failures: u32) -> Duration {
        1u32.checked_shl(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Requeue immediately. Used by tests that drive the retry path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn delay(&self, _failures: u32) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let backoff = ExponentialBackoff::default();

        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(10), Duration::from_millis(5120));
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let backoff = ExponentialBackoff::default();

        // 5ms * 2^18 = 1310.72s, past the cap
        assert_eq!(backoff.delay(18), Duration::from_secs(1000));
        // Shift overflow must still land on the cap
        assert_eq!(backoff.delay(40), Duration::from_secs(1000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1000));
    }

    #[test]
    fn test_custom_bounds() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(4), Duration::from_secs(10));
    }

    #[test]
    fn test_no_backoff() {
        assert_eq!(NoBackoff.delay(0), Duration::ZERO);
        assert_eq!(NoBackoff.delay(100), Duration::ZERO);
    }
}
