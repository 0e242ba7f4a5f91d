use approx::assert_relative_eq;
use phoenix_core::core::{CancelToken, ManualClock, SleepOutcome};
use phoenix_core::resilience::{Backoff, BackoffPolicy, BACKOFF_MULTIPLIER};
use proptest::prelude::*;
use std::thread;
use std::time::Duration;

fn policy(base_ms: u64, max_ms: u64, jitter: f64) -> BackoffPolicy {
    BackoffPolicy {
        base_interval: Duration::from_millis(base_ms),
        max_interval: Duration::from_millis(max_ms),
        jitter_fraction: jitter,
        max_attempts: 16,
    }
}

#[test]
fn prop_nominal_interval_doubles_until_capped() {
    proptest!(|(base in 1u64..5_000, cap_factor in 1u64..200, n in 0u32..40)| {
        let p = policy(base, base * cap_factor, 0.0);
        let this = p.nominal_interval(n);
        let next = p.nominal_interval(n + 1);
        prop_assert_eq!(next, p.max_interval.min(this * BACKOFF_MULTIPLIER));
        prop_assert!(next <= p.max_interval);
        prop_assert!(next >= this);
    });
}

#[test]
fn prop_jittered_interval_within_bounds() {
    proptest!(|(base in 1u64..5_000, n in 0u32..20, jitter in 0.0f64..1.0)| {
        let p = policy(base, 60_000, jitter);
        let (lo, hi) = p.jitter_bounds(n);
        let d = p.next_interval(n);
        // f64 round trip through Duration can lose a nanosecond either way
        prop_assert!(d + Duration::from_nanos(1) >= lo, "{:?} below {:?}", d, lo);
        prop_assert!(d <= hi + Duration::from_nanos(1), "{:?} above {:?}", d, hi);
    });
}

#[test]
fn test_default_sequence() {
    let p = BackoffPolicy {
        jitter_fraction: 0.0,
        ..BackoffPolicy::default()
    };
    let mut backoff = Backoff::new(p);
    let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
        .map(|d| d.as_secs())
        .collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    assert!(backoff.is_exhausted());

    backoff.reset();
    assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
}

#[test]
fn test_jitter_spread() {
    let p = policy(1_000, 60_000, 0.1);
    let samples: Vec<f64> = (0..500).map(|_| p.next_interval(3).as_secs_f64()).collect();
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    assert_relative_eq!(mean, 8.0, max_relative = 0.05);
}

#[test]
fn test_wait_is_cancelled_by_halt_token() {
    let clock = ManualClock::shared();
    let cancel = CancelToken::new();
    let mut backoff = Backoff::new(policy(60_000, 60_000, 0.0));

    let waiter_clock = clock.clone();
    let waiter_cancel = cancel.clone();
    let waiter = thread::spawn(move || backoff.wait(waiter_clock.as_ref(), &waiter_cancel));

    cancel.cancel();
    assert_eq!(waiter.join().unwrap(), Some(SleepOutcome::Cancelled));
    assert_eq!(clock.elapsed(), Duration::ZERO);
}
