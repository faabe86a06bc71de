//! Time source abstraction.
//!
//! All components read time through a `Clock` rather than calling
//! `Utc::now()` directly, so tests can advance time deterministically
//! (needed for the cron fire, retry backoff, handler timeout, and uptime
//! gap scenarios).

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// A source of the current UTC time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall-clock, used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to, used in tests.
pub struct FakeClock {
    inner: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(start),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut guard = self.inner.lock().expect("fake clock lock poisoned");
        *guard += delta;
    }

    /// Set the clock to an absolute instant.
    pub fn set(&self, when: DateTime<Utc>) {
        let mut guard = self.inner.lock().expect("fake clock lock poisoned");
        *guard = when;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().expect("fake clock lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let start = "2024-01-01T00:00:00Z".parse().unwrap();
        let clock = FakeClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::seconds(70));
        assert_eq!(clock.now(), start + Duration::seconds(70));
    }

    #[test]
    fn fake_clock_set_is_absolute() {
        let clock = FakeClock::new("2024-01-01T00:00:00Z".parse().unwrap());
        let later: DateTime<Utc> = "2024-06-01T12:00:00Z".parse().unwrap();
        clock.set(later);
        assert_eq!(clock.now(), later);
    }

    #[test]
    fn system_clock_moves_forward_between_calls() {
        let clock = SystemClock;
        let a = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now();
        assert!(b >= a);
    }
}
