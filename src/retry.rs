//! Backoff computation for the delivery state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::RetryStrategy;

/// Delay before the next attempt, given that `attempts_made` attempts have
/// already executed (so the first retry is computed with `attempts_made = 1`).
///
/// Every strategy's result is bounded by `cap`.
pub fn retry_delay(
    strategy: RetryStrategy,
    attempts_made: u32,
    base: Duration,
    cap: Duration,
) -> Duration {
    let delay = match strategy {
        RetryStrategy::ExponentialBackoff => {
            let pow = 2u32.saturating_pow(attempts_made.saturating_sub(1));
            base.saturating_mul(pow)
        }
        RetryStrategy::LinearBackoff => base.saturating_mul(attempts_made.max(1)),
        RetryStrategy::FixedInterval => base,
        RetryStrategy::Immediate => Duration::ZERO,
        // A delivery under `None` never reaches a retry; the ceiling is
        // clamped to one attempt at creation time.
        RetryStrategy::None => Duration::ZERO,
    };
    delay.min(cap)
}

/// Uniform random jitter in `[0, jitter]`.
pub fn jitter(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter.as_millis() as u64))
}

/// Advance a wall-clock time by a std duration.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(delay) {
        Ok(d) => now + d,
        Err(_) => now + chrono::Duration::days(365),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(60);
    const CAP: Duration = Duration::from_secs(3600);

    #[test]
    fn exponential_doubles_per_attempt() {
        let d1 = retry_delay(RetryStrategy::ExponentialBackoff, 1, BASE, CAP);
        let d2 = retry_delay(RetryStrategy::ExponentialBackoff, 2, BASE, CAP);
        let d3 = retry_delay(RetryStrategy::ExponentialBackoff, 3, BASE, CAP);
        assert_eq!(d1, Duration::from_secs(60));
        assert_eq!(d2, Duration::from_secs(120));
        assert_eq!(d3, Duration::from_secs(240));
    }

    #[test]
    fn exponential_is_monotonic_under_cap() {
        let mut previous = Duration::ZERO;
        for attempt in 1..20 {
            let delay = retry_delay(RetryStrategy::ExponentialBackoff, attempt, BASE, CAP);
            assert!(delay >= previous, "attempt {attempt} shrank the delay");
            assert!(delay <= CAP);
            previous = delay;
        }
    }

    #[test]
    fn linear_grows_by_base() {
        assert_eq!(
            retry_delay(RetryStrategy::LinearBackoff, 3, BASE, CAP),
            Duration::from_secs(180)
        );
    }

    #[test]
    fn fixed_and_immediate() {
        assert_eq!(retry_delay(RetryStrategy::FixedInterval, 7, BASE, CAP), BASE);
        assert_eq!(
            retry_delay(RetryStrategy::Immediate, 7, BASE, CAP),
            Duration::ZERO
        );
    }

    #[test]
    fn cap_bounds_every_strategy() {
        let cap = Duration::from_secs(90);
        assert_eq!(
            retry_delay(RetryStrategy::ExponentialBackoff, 10, BASE, cap),
            cap
        );
        assert_eq!(retry_delay(RetryStrategy::LinearBackoff, 10, BASE, cap), cap);
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let j = jitter(Duration::from_millis(50));
            assert!(j <= Duration::from_millis(50));
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}
