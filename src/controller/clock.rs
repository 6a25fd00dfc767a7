//! Time source for the updater
//!
//! Every gate (cooldown, canary, notification, windows) compares against a
//! single `now` taken at the start of a pass. Production reads the wall clock;
//! tests pin it with `MockClock`.

use chrono::{DateTime, Utc};

/// Trait for getting the current time
///
/// Injected into the `Updater` and the registrar so tests control time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to `chrono::Utc::now()`
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for testing with controllable time
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Clock pinned to an RFC3339 instant
    pub fn at(rfc3339: &str) -> Self {
        let now = DateTime::parse_from_rfc3339(rfc3339)
            .expect("MockClock::at needs an RFC3339 timestamp")
            .with_timezone(&Utc);
        Self::new(now)
    }

    #[allow(dead_code)]
    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2024() {
        assert!(SystemClock.now().timestamp() > 1_704_067_200);
    }

    #[test]
    fn test_mock_clock_pinned_and_advanced() {
        let clock = MockClock::at("2026-03-02T09:00:00Z");
        assert_eq!(clock.now().to_rfc3339(), "2026-03-02T09:00:00+00:00");

        clock.advance(chrono::Duration::hours(3));
        assert_eq!(clock.now().to_rfc3339(), "2026-03-02T12:00:00+00:00");
    }
}
