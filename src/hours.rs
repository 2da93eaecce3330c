use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::model::{Interval, MINUTE_MS, Ms};

const DAY_MS: Ms = 86_400_000;
const DAY_NAMES: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// Opening window of one weekday, in minutes after UTC midnight. `close` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub open: u16,
    pub close: u16,
}

/// Weekly opening hours, indexed Monday = 0. A `None` day is closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub days: [Option<DayHours>; 7],
}

#[derive(Deserialize)]
struct RawDay {
    open: String,
    close: String,
}

impl OperatingHours {
    /// Parse the business profile's JSON form:
    /// `{"mon": {"open": "09:00", "close": "17:30"}, "sun": null}`.
    /// Day keys accept three-letter or full English names; missing days are closed.
    pub fn parse(text: &str) -> Result<Self, String> {
        let raw: BTreeMap<String, Option<RawDay>> =
            serde_json::from_str(text).map_err(|e| format!("bad operating hours: {e}"))?;
        let mut hours = OperatingHours::default();
        for (key, day) in raw {
            let idx = day_index(&key).ok_or_else(|| format!("unknown weekday: {key}"))?;
            let Some(day) = day else { continue };
            let open = parse_clock(&day.open)?;
            let close = parse_clock(&day.close)?;
            if close <= open {
                return Err(format!("{key}: close {} is not after open {}", day.close, day.open));
            }
            hours.days[idx] = Some(DayHours { open, close });
        }
        Ok(hours)
    }

    /// True if the whole interval falls inside the opening window of the
    /// UTC weekday it starts on.
    pub fn contains(&self, interval: &Interval) -> bool {
        let Some(start) = DateTime::from_timestamp_millis(interval.start) else {
            return false;
        };
        let Some(day) = self.days[start.weekday().num_days_from_monday() as usize] else {
            return false;
        };
        let midnight = interval.start - interval.start.rem_euclid(DAY_MS);
        let open_at = midnight + day.open as Ms * MINUTE_MS;
        let close_at = midnight + day.close as Ms * MINUTE_MS;
        interval.start >= open_at && interval.end() <= close_at
    }
}

fn day_index(key: &str) -> Option<usize> {
    let key = key.trim().to_lowercase();
    if key.len() < 3 {
        return None;
    }
    DAY_NAMES
        .iter()
        .position(|name| *name == key || (key.len() == 3 && name.starts_with(&key)))
}

fn parse_clock(s: &str) -> Result<u16, String> {
    if s.trim() == "24:00" {
        return Ok(24 * 60);
    }
    let t = NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|e| format!("bad time {s:?}: {e}"))?;
    Ok((t.hour() * 60 + t.minute()) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    /// 2026-10-12T00:00:00Z, a Monday.
    const MONDAY: Ms = 1_791_763_200_000;

    fn weekdays_nine_to_five() -> OperatingHours {
        OperatingHours::parse(
            r#"{"mon": {"open": "09:00", "close": "17:00"},
                "tuesday": {"open": "09:00", "close": "17:00"},
                "sat": {"open": "10:00", "close": "24:00"},
                "sun": null}"#,
        )
        .unwrap()
    }

    #[test]
    fn monday_constant_is_a_monday() {
        let dt = DateTime::from_timestamp_millis(MONDAY).unwrap();
        assert_eq!(dt.weekday(), chrono::Weekday::Mon);
        assert_eq!(dt.hour(), 0);
    }

    #[test]
    fn parse_days() {
        let hours = weekdays_nine_to_five();
        assert_eq!(hours.days[0], Some(DayHours { open: 540, close: 1020 }));
        assert_eq!(hours.days[1], Some(DayHours { open: 540, close: 1020 }));
        assert_eq!(hours.days[2], None);
        assert_eq!(hours.days[5], Some(DayHours { open: 600, close: 1440 }));
        assert_eq!(hours.days[6], None);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(OperatingHours::parse("not json").is_err());
        assert!(OperatingHours::parse(r#"{"funday": null}"#).is_err());
        assert!(OperatingHours::parse(r#"{"mon": {"open": "17:00", "close": "09:00"}}"#).is_err());
        assert!(OperatingHours::parse(r#"{"mon": {"open": "9am", "close": "17:00"}}"#).is_err());
    }

    #[test]
    fn inside_window() {
        let hours = weekdays_nine_to_five();
        assert!(hours.contains(&Interval::new(MONDAY + 9 * H, 60)));
        // Ends exactly at close.
        assert!(hours.contains(&Interval::new(MONDAY + 16 * H, 60)));
    }

    #[test]
    fn outside_window() {
        let hours = weekdays_nine_to_five();
        assert!(!hours.contains(&Interval::new(MONDAY + 8 * H, 60)));
        assert!(!hours.contains(&Interval::new(MONDAY + 16 * H, 61)));
        // Wednesday is closed.
        assert!(!hours.contains(&Interval::new(MONDAY + 2 * 24 * H + 10 * H, 30)));
    }

    #[test]
    fn open_until_midnight() {
        let hours = weekdays_nine_to_five();
        let saturday = MONDAY + 5 * 24 * H;
        assert!(hours.contains(&Interval::new(saturday + 23 * H, 60)));
        assert!(!hours.contains(&Interval::new(saturday + 23 * H, 61)));
    }
}
