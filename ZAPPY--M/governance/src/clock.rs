use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Time source injected into every governance component.
///
/// Wall time is only ever recorded for operators; every eligibility decision
/// uses [`Clock::monotonic_secs`].
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn wall_now(&self) -> DateTime<Utc>;

    /// Seconds on a clock that never steps backwards and keeps counting
    /// across process restarts on the same boot.
    fn monotonic_secs(&self) -> f64;
}

/// Production clock backed by `CLOCK_MONOTONIC`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    #[cfg(unix)]
    #[allow(clippy::cast_precision_loss)]
    fn monotonic_secs(&self) -> f64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return 0.0;
        }
        ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
    }

    // Only meaningful within one process; non-unix hosts are not deployment targets.
    #[cfg(not(unix))]
    fn monotonic_secs(&self) -> f64 {
        static ANCHOR: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
        ANCHOR
            .get_or_init(std::time::Instant::now)
            .elapsed()
            .as_secs_f64()
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<(DateTime<Utc>, f64)>,
}

impl ManualClock {
    /// Creates a clock reading `monotonic` seconds.
    #[must_use]
    pub fn new(monotonic: f64) -> Self {
        Self {
            inner: Mutex::new((Utc::now(), monotonic)),
        }
    }

    /// Moves the monotonic reading forward by `secs`.
    pub fn advance(&self, secs: f64) {
        self.inner.lock().1 += secs;
    }

    /// Sets the monotonic reading, including backwards jumps used to simulate
    /// tampering.
    pub fn set_monotonic(&self, secs: f64) {
        self.inner.lock().1 = secs;
    }
}

impl Clock for ManualClock {
    fn wall_now(&self) -> DateTime<Utc> {
        self.inner.lock().0
    }

    fn monotonic_secs(&self) -> f64 {
        self.inner.lock().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_does_not_step_backwards() {
        let clock = SystemClock;
        let first = clock.monotonic_secs();
        let second = clock.monotonic_secs();
        assert!(second >= first);
        assert!(first > 0.0);
    }

    #[test]
    fn manual_clock_moves_both_ways() {
        let clock = ManualClock::new(100.0);
        clock.advance(5.5);
        assert!((clock.monotonic_secs() - 105.5).abs() < f64::EPSILON);
        clock.set_monotonic(10.0);
        assert!((clock.monotonic_secs() - 10.0).abs() < f64::EPSILON);
    }
}
