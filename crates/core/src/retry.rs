//! Retry policy for failed uploads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retry policy configuration.
///
/// Delay after attempt `n` is `base_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that fails a job on its first error.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Backoff after `attempts` attempts have been made.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        // 2^31 already overflows any realistic cap; clamp the shift.
        let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Check if another attempt is allowed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// `now + delay`, saturating at the latest representable instant.
pub fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - age`, saturating at the earliest representable instant.
///
/// An over-large `age` yields a cutoff nothing can be older than.
pub fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::exponential(50, Duration::from_secs(1), Duration::from_secs(30));

        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn deadline_after_adds_the_delay() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        assert_eq!(
            deadline_after(now, policy.delay_for_attempt(1)),
            now + chrono::Duration::seconds(2)
        );
        assert_eq!(
            cutoff_before(now, Duration::from_secs(60)),
            now - chrono::Duration::seconds(60)
        );
    }

    #[test]
    fn huge_durations_saturate_instead_of_overflowing() {
        let now = Utc::now();
        assert_eq!(
            deadline_after(now, Duration::from_millis(10u64.pow(16))),
            DateTime::<Utc>::MAX_UTC
        );
        assert_eq!(deadline_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            cutoff_before(now, Duration::from_millis(u64::MAX)),
            DateTime::<Utc>::MIN_UTC
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: successive retry delays never shrink and never exceed the cap.
        #[test]
        fn backoff_is_non_decreasing_and_capped(
            base_ms in 1u64..10_000,
            cap_ms in 1u64..1_000_000,
            attempts in 0u32..64,
        ) {
            let policy = RetryPolicy::exponential(
                64,
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );

            let current = policy.delay_for_attempt(attempts);
            let next = policy.delay_for_attempt(attempts + 1);

            prop_assert!(next >= current);
            prop_assert!(next <= Duration::from_millis(cap_ms));
        }
    }
}
