//! Exponential backoff for reconnection attempts
//!
//! `interval(n) = min(max_interval, base_interval * 2^n) * (1 ± jitter_fraction)`.
//! Waits go through the injected [`Clock`] and end the moment their
//! [`CancelToken`] fires, so a halt never waits out a retry sleep.

use crate::core::clock::{CancelToken, Clock, SleepOutcome};
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Fixed growth factor between consecutive attempts
pub const BACKOFF_MULTIPLIER: u32 = 2;

/// Configuration for exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_interval: Duration,
    /// Upper bound on the jitter-free delay
    pub max_interval: Duration,
    /// Uniform jitter applied as `1 ± jitter_fraction` (0.0 to 1.0)
    pub jitter_fraction: f64,
    /// Attempts before auto-retry stops and an operator must step in
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            jitter_fraction: 0.1,
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Aggressive configuration (for testing)
    pub fn aggressive() -> Self {
        Self {
            base_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            jitter_fraction: 0.0,
            max_attempts: 3,
        }
    }

    /// Jitter-free interval for attempt `n` (0-based)
    pub fn nominal_interval(&self, attempt: u32) -> Duration {
        let factor = BACKOFF_MULTIPLIER.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_interval
            .checked_mul(factor)
            .map_or(self.max_interval, |d| d.min(self.max_interval))
    }

    /// Interval for attempt `n` with uniform jitter applied
    pub fn next_interval(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_interval(attempt);
        if self.jitter_fraction <= 0.0 {
            return nominal;
        }
        let j = self.jitter_fraction.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-j..=j);
        Duration::from_secs_f64(nominal.as_secs_f64() * factor)
    }

    /// Bounds `next_interval(attempt)` always falls within
    pub fn jitter_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal_interval(attempt).as_secs_f64();
        let j = self.jitter_fraction.clamp(0.0, 1.0);
        (
            Duration::from_secs_f64(nominal * (1.0 - j)),
            Duration::from_secs_f64(nominal * (1.0 + j)),
        )
    }
}

/// Backoff state: the policy plus the attempt counter
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt_count: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, advancing the counter
    ///
    /// Returns None once `max_attempts` have been consumed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.policy.next_interval(self.attempt_count);
        self.attempt_count += 1;
        Some(delay)
    }

    /// Sleep for the next delay through `clock`
    ///
    /// `None` when exhausted, otherwise whether the wait elapsed or was cancelled.
    pub fn wait(&mut self, clock: &dyn Clock, cancel: &CancelToken) -> Option<SleepOutcome> {
        let delay = self.next_delay()?;
        debug!(
            "Backoff attempt {}/{}: waiting {:?}",
            self.attempt_count, self.policy.max_attempts, delay
        );
        Some(clock.sleep(delay, cancel))
    }

    /// Reset after a success
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.policy.max_attempts
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_nominal_doubles_until_cap() {
        let policy = BackoffPolicy {
            base_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            jitter_fraction: 0.0,
            max_attempts: 10,
        };
        assert_eq!(policy.nominal_interval(0), Duration::from_secs(1));
        assert_eq!(policy.nominal_interval(1), Duration::from_secs(2));
        assert_eq!(policy.nominal_interval(3), Duration::from_secs(8));
        assert_eq!(policy.nominal_interval(4), Duration::from_secs(10));
        assert_eq!(policy.nominal_interval(200), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = BackoffPolicy {
            jitter_fraction: 0.25,
            ..Default::default()
        };
        for attempt in 0..8 {
            let (lo, hi) = policy.jitter_bounds(attempt);
            for _ in 0..50 {
                let d = policy.next_interval(attempt);
                assert!(d >= lo && d <= hi, "{d:?} outside [{lo:?}, {hi:?}]");
            }
        }
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut backoff = Backoff::new(BackoffPolicy::aggressive());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert!(backoff.is_exhausted());

        backoff.reset();
        assert_eq!(backoff.attempt_count(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_is_cancellable() {
        let clock = ManualClock::shared();
        let cancel = CancelToken::new();
        let mut backoff = Backoff::new(BackoffPolicy {
            base_interval: Duration::from_secs(3600),
            ..Default::default()
        });

        let waiter_clock: Arc<ManualClock> = clock.clone();
        let waiter_cancel = cancel.clone();
        let handle = thread::spawn(move || backoff.wait(waiter_clock.as_ref(), &waiter_cancel));

        cancel.cancel();
        assert_eq!(handle.join().unwrap(), Some(SleepOutcome::Cancelled));
        // virtual time never moved
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
