//! Time source for expiry decisions.
//!
//! Every expiry in the access core (sessions, CSRF tokens, counters, locks) is
//! evaluated lazily against a `Clock`, so tests can move time forward without
//! sleeping.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::fmt;

pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts at the current system time, truncated to whole seconds.
    #[must_use]
    pub fn starting_now() -> Self {
        let now = Utc::now();
        let truncated = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        Self::new(truncated)
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Milliseconds until `deadline`, never less than 1 while the deadline is in the future.
pub(crate) fn millis_until(now: DateTime<Utc>, deadline: DateTime<Utc>) -> u64 {
    let remaining = deadline.signed_duration_since(now).num_milliseconds();
    u64::try_from(remaining.max(1)).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(15));
        assert_eq!(clock.now() - start, Duration::minutes(15));
    }

    #[test]
    fn millis_until_is_positive() {
        let clock = ManualClock::starting_now();
        let now = clock.now();
        assert_eq!(millis_until(now, now + Duration::seconds(2)), 2000);
        assert_eq!(millis_until(now, now - Duration::seconds(2)), 1);
    }
}
