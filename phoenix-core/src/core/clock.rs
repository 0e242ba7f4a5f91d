//! Injectable time source
//!
//! Every timer-driven component (breaker recovery, backoff waits, heartbeat
//! deadlines, stall detection, reconciliation cadence) reads time through a
//! [`Clock`]. Production wires [`SystemClock`]; tests wire [`ManualClock`]
//! and fast-forward deterministically instead of sleeping.
//!
//! Waits are always paired with a [`CancelToken`] so a halt or an operator
//! stop never has to wait out a sleep.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Outcome of a cancellable wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The deadline was reached
    Elapsed,
    /// The cancel token fired before the deadline
    Cancelled,
}

/// Time source used by every timer in the crate
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic now
    fn now(&self) -> Instant;

    /// Wall-clock now (audit timestamps)
    fn wall_time(&self) -> SystemTime;

    /// Block until `deadline` or until `cancel` fires, whichever comes first
    fn sleep_until(&self, deadline: Instant, cancel: &CancelToken) -> SleepOutcome;

    /// Block for `duration` or until `cancel` fires
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> SleepOutcome {
        let deadline = self.now() + duration;
        self.sleep_until(deadline, cancel)
    }

    /// Wall-clock milliseconds since the Unix epoch
    fn wall_millis(&self) -> u64 {
        self.wall_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

// ============================================================================
// Cancellation
// ============================================================================

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

/// One-shot cancellation signal shared between a waiter and its canceller
///
/// Cloning shares the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token and wake every waiter
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.cond.notify_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Wait (real time) until `deadline` or cancellation
    ///
    /// Returns true if cancelled.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self.inner.cond.wait_until(&mut cancelled, deadline).timed_out() {
                return *cancelled;
            }
        }
        true
    }

    /// Wait (real time) for at most `timeout`
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}

// ============================================================================
// SystemClock
// ============================================================================

/// Real wall/monotonic clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: Instant, cancel: &CancelToken) -> SleepOutcome {
        if cancel.wait_until(deadline) {
            SleepOutcome::Cancelled
        } else {
            SleepOutcome::Elapsed
        }
    }
}

// ============================================================================
// ManualClock
// ============================================================================

/// Real-time granularity at which manual-clock sleepers re-check cancellation
const MANUAL_POLL: Duration = Duration::from_millis(1);

/// Virtual clock advanced explicitly by tests
///
/// Time only moves on [`ManualClock::advance`] / [`ManualClock::set_elapsed`].
/// Sleepers wake as soon as virtual time passes their deadline or their
/// cancel token fires.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: SystemTime,
    elapsed: Mutex<Duration>,
    advanced: Condvar,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: SystemTime::now(),
            elapsed: Mutex::new(Duration::ZERO),
            advanced: Condvar::new(),
        }
    }

    /// Create a shareable manual clock
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Move virtual time forward
    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock();
        *elapsed += by;
        self.advanced.notify_all();
    }

    /// Jump to an absolute offset from the clock origin (never backwards)
    pub fn set_elapsed(&self, offset: Duration) {
        let mut elapsed = self.elapsed.lock();
        if offset > *elapsed {
            *elapsed = offset;
        }
        self.advanced.notify_all();
    }

    /// Virtual time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }

    /// The instant corresponding to virtual offset zero
    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }

    fn wall_time(&self) -> SystemTime {
        self.wall_origin + *self.elapsed.lock()
    }

    fn sleep_until(&self, deadline: Instant, cancel: &CancelToken) -> SleepOutcome {
        let target = deadline.saturating_duration_since(self.origin);
        loop {
            if cancel.is_cancelled() {
                return SleepOutcome::Cancelled;
            }
            let mut elapsed = self.elapsed.lock();
            if *elapsed >= target {
                return SleepOutcome::Elapsed;
            }
            self.advanced.wait_for(&mut elapsed, MANUAL_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_manual_clock_advances_only_on_request() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - t0, Duration::from_secs(5));

        // set_elapsed never moves backwards
        clock.set_elapsed(Duration::from_secs(1));
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn test_manual_sleep_wakes_on_advance() {
        let clock = ManualClock::shared();
        let cancel = CancelToken::new();
        let deadline = clock.now() + Duration::from_secs(60);

        let sleeper_clock = clock.clone();
        let sleeper_cancel = cancel.clone();
        let handle =
            thread::spawn(move || sleeper_clock.sleep_until(deadline, &sleeper_cancel));

        clock.advance(Duration::from_secs(60));
        assert_eq!(handle.join().unwrap(), SleepOutcome::Elapsed);
    }

    #[test]
    fn test_manual_sleep_cancelled() {
        let clock = ManualClock::shared();
        let cancel = CancelToken::new();
        let deadline = clock.now() + Duration::from_secs(3600);

        let sleeper_clock = clock.clone();
        let sleeper_cancel = cancel.clone();
        let handle =
            thread::spawn(move || sleeper_clock.sleep_until(deadline, &sleeper_cancel));

        cancel.cancel();
        assert_eq!(handle.join().unwrap(), SleepOutcome::Cancelled);
    }

    #[test]
    fn test_system_clock_sleep_cancel_is_immediate() {
        let clock = SystemClock;
        let cancel = CancelToken::new();
        let canceller = cancel.clone();

        let started = Instant::now();
        let handle = thread::spawn(move || {
            clock.sleep(Duration::from_secs(30), &cancel)
        });
        thread::sleep(Duration::from_millis(10));
        canceller.cancel();

        assert_eq!(handle.join().unwrap(), SleepOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_already_cancelled_token_returns_immediately() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = clock.sleep(Duration::from_secs(10), &cancel);
        assert_eq!(outcome, SleepOutcome::Cancelled);
    }
}
