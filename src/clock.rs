//! Single time source for the engine.
//!
//! Every timestamp in the pipeline (frame completion, window alignment,
//! no-data scans, store rows) comes from a [`Clock`] so tests can drive
//! time explicitly. Production uses the system wall clock in UTC.

use std::sync::Arc;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock, UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn set(&self, t: OffsetDateTime) {
        *self.now.lock() = t;
    }

    pub fn advance(&self, d: time::Duration) {
        let mut now = self.now.lock();
        *now += d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// ISO-8601 round-trip form used for every persisted timestamp.
pub fn format_ts(t: OffsetDateTime) -> String {
    t.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

pub fn parse_ts(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2024-03-01 12:00:00 UTC));
        clock.advance(time::Duration::seconds(11));
        assert_eq!(clock.now(), datetime!(2024-03-01 12:00:11 UTC));
    }

    #[test]
    fn timestamps_round_trip() {
        let t = datetime!(2024-03-01 12:00:00.5 UTC);
        assert_eq!(parse_ts(&format_ts(t)), Some(t));
    }
}
