//! `time` and `duration` primitive values.

use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A point in time: unsigned seconds and nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time {
    pub secs: u32,
    pub nsecs: u32,
}

impl Time {
    pub fn new(secs: u32, nsecs: u32) -> Self {
        Self { secs, nsecs }
    }

    /// Convert from a `chrono` timestamp, saturating outside the u32 range.
    pub fn from_datetime(at: chrono::DateTime<chrono::Utc>) -> Self {
        let secs = at.timestamp().clamp(0, u32::MAX as i64) as u32;
        Self {
            secs,
            nsecs: at.timestamp_subsec_nanos(),
        }
    }
}

/// A signed span of time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Duration {
    pub secs: i32,
    pub nsecs: i32,
}

impl Duration {
    pub fn new(secs: i32, nsecs: i32) -> Self {
        Self { secs, nsecs }
    }

    pub fn total_nanos(&self) -> i64 {
        self.secs as i64 * NANOS_PER_SEC + self.nsecs as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_from_datetime() {
        let at = chrono::Utc.timestamp_opt(1_700_000_000, 42).unwrap();
        assert_eq!(Time::from_datetime(at), Time::new(1_700_000_000, 42));
    }

    #[test]
    fn test_duration_nanos() {
        assert_eq!(Duration::new(1, 5).total_nanos(), 1_000_000_005);
        assert_eq!(Duration::new(-1, 0).total_nanos(), -1_000_000_000);
    }
}
