use std::fmt;

use chrono::{DateTime, Timelike};
use chrono_tz::Tz;

use crate::errors::ConfigError;

/// Calendar date in the configured zone, formatted `YYYY_MM_DD`.
///
/// The same string partitions the in-memory counter maps and is the suffix
/// of the per-day table names, so there is exactly one formatter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DateKey(String);

impl DateKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Converts event unix timestamps into the configured time zone.
///
/// The zone is resolved once at startup; an unknown zone is fatal there
/// rather than per event.
pub struct Clock {
    tz: Tz,
}

impl Clock {
    pub fn new(zone: &str) -> Result<Self, ConfigError> {
        let tz = zone.parse::<Tz>().map_err(|e| ConfigError::TimeZone {
            zone: zone.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { tz })
    }

    fn local(&self, unix_time: i64) -> Option<DateTime<Tz>> {
        DateTime::from_timestamp(unix_time, 0).map(|utc| utc.with_timezone(&self.tz))
    }

    /// `None` when the timestamp is outside chrono's representable range.
    pub fn date_key(&self, unix_time: i64) -> Option<DateKey> {
        self.local(unix_time)
            .map(|t| DateKey(t.format("%Y_%m_%d").to_string()))
    }

    /// `hour * 60 + minute` in the configured zone, range 0..=1439.
    pub fn minute_of_day(&self, unix_time: i64) -> Option<u16> {
        self.local(unix_time)
            .map(|t| (t.hour() * 60 + t.minute()) as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn derives_date_and_minute_in_utc() {
        // 2023-11-14 22:13:20 UTC
        let clock = Clock::new("UTC").unwrap();
        assert_eq!(clock.date_key(1_700_000_000).unwrap().as_str(), "2023_11_14");
        assert_eq!(clock.minute_of_day(1_700_000_000), Some(22 * 60 + 13));
    }

    #[test]
    fn last_second_of_day_maps_to_minute_1439() {
        // 2024-01-15 22:59:59 UTC is 23:59:59 in Berlin (+01:00).
        let clock = Clock::new("Europe/Berlin").unwrap();
        assert_eq!(clock.minute_of_day(1_705_359_599), Some(1439));
        assert_eq!(clock.date_key(1_705_359_599).unwrap().as_str(), "2024_01_15");
    }

    #[test]
    fn local_zone_can_shift_into_the_next_day() {
        // 2024-01-15 23:30:00 UTC is already 2024-01-16 00:30 in Berlin.
        let clock = Clock::new("Europe/Berlin").unwrap();
        assert_eq!(clock.date_key(1_705_361_400).unwrap().as_str(), "2024_01_16");
        assert_eq!(clock.minute_of_day(1_705_361_400), Some(30));
    }

    #[test]
    fn local_zone_can_shift_into_the_previous_day() {
        // 2024-01-16 02:00:00 UTC is 2024-01-15 21:00 in New York (-05:00).
        let clock = Clock::new("America/New_York").unwrap();
        assert_eq!(clock.date_key(1_705_370_400).unwrap().as_str(), "2024_01_15");
        assert_eq!(clock.minute_of_day(1_705_370_400), Some(21 * 60));
    }

    #[test]
    fn unknown_zone_is_rejected() {
        assert!(Clock::new("Not/AZone").is_err());
    }

    #[test]
    fn out_of_range_timestamp_yields_none() {
        let clock = Clock::new("UTC").unwrap();
        assert_eq!(clock.date_key(i64::MAX), None);
        assert_eq!(clock.minute_of_day(i64::MAX), None);
    }
}
