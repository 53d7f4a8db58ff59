//! Small helpers shared by the phases, the group and the allocator.

use crate::error::PadoccError;
use crate::project::Phase;

use std::path::Path;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// Timestamp format of status log rows (`HH:MM DD/MM/YY`).
const STATUS_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[hour]:[minute] [day]/[month]/[year repr:last_two]");

/// Date format of history lines and creation dates (`DD/MM/YY`).
const DATE_FORMAT: &[FormatItem<'static>] =
    format_description!("[day]/[month]/[year repr:last_two]");

/// Returns the advisory time budget for a phase in `MM:SS` form.
pub fn phase_time_budget(phase: Phase) -> &'static str {
    match phase {
        Phase::Init => "10:00",
        Phase::Scan => "10:00",
        Phase::Compute => "60:00",
        Phase::Validate => "30:00",
    }
}

/// Convert a `MM:SS` time allowance to seconds.
///
/// An empty allowance is treated as unbounded.
pub fn get_seconds(time_allowed: &str) -> Result<u64, PadoccError> {
    if time_allowed.is_empty() {
        return Ok(u64::MAX);
    }
    let (mins, secs) = time_allowed
        .split_once(':')
        .ok_or_else(|| PadoccError::InvalidConfig(format!("bad time {}", time_allowed)))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u64>()
            .map_err(|_| PadoccError::InvalidConfig(format!("bad time {}", time_allowed)))
    };
    Ok(parse(secs)? + 60 * parse(mins)?)
}

/// Convert seconds into a `MM:00` allowance, rounding up to the next minute.
pub fn format_seconds(seconds: f64) -> String {
    let mins = (seconds / 60.0) as u64 + 1;
    format!("{:02}:00", mins)
}

/// Format a byte count with decimal units, e.g. `1.50 GB`.
pub fn format_float(value: f64) -> Option<String> {
    if value == 0.0 || !value.is_finite() {
        return None;
    }
    let units = ["", "K", "M", "G", "T", "P"];
    let mut value = value;
    let mut unit_index = 0;
    while value > 1000.0 && unit_index < units.len() - 1 {
        value /= 1000.0;
        unit_index += 1;
    }
    Some(format!("{:.2} {}B", value, units[unit_index]))
}

/// Inverse of [format_float].
pub fn deformat_float(value: &str) -> Option<f64> {
    let (number, unit) = value.trim().split_once(' ')?;
    let number: f64 = number.parse().ok()?;
    let multiplier = match unit {
        "B" => 1.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "PB" => 1e15,
        _ => return None,
    };
    Some(number * multiplier)
}

/// Pad or truncate a string to a fixed width.
///
/// With `concat`, strings at least `length` long are shortened with a trailing ellipsis.
pub fn format_str(value: &str, length: usize, concat: bool) -> String {
    let count = value.chars().count();
    if count >= length && concat && length > 3 {
        let mut out: String = value.chars().take(length - 3).collect();
        out.push_str("...");
        out
    } else if count >= length {
        value.chars().take(length).collect()
    } else {
        format!("{:<width$}", value, width = length)
    }
}

/// Find the divisor of `num` closest to `closest`.
///
/// Ties keep the smaller divisor.
pub fn find_closest(num: usize, closest: f64) -> usize {
    if num == 0 {
        return 0;
    }
    let mut divisors = Vec::new();
    let mut x = 1;
    while x * x <= num {
        if num % x == 0 {
            divisors.push(x);
            divisors.push(num / x);
        }
        x += 1;
    }
    divisors.sort_unstable();
    divisors.dedup();
    let mut best = divisors[0];
    let mut min_diff = f64::MAX;
    for d in divisors {
        let diff = (d as f64 - closest).abs();
        if diff < min_diff {
            min_diff = diff;
            best = d;
        }
    }
    best
}

/// Read a text file into trimmed lines, skipping empty lines.
pub fn extract_file(path: &Path) -> Result<Vec<String>, PadoccError> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Current local time, falling back to UTC when the offset is unknown.
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Format a time as a status log timestamp.
pub fn status_timestamp(when: OffsetDateTime) -> String {
    when.format(STATUS_TIME_FORMAT).unwrap_or_default()
}

/// Format a date as `DD/MM/YY`.
pub fn format_date(when: OffsetDateTime) -> String {
    when.format(DATE_FORMAT).unwrap_or_default()
}

/// Parse a status log timestamp (`HH:MM DD/MM/YY`).
///
/// Two-digit years are taken to be in the 2000s.
pub fn parse_status_timestamp(value: &str) -> Option<PrimitiveDateTime> {
    let (clock, date) = value.trim().split_once(' ')?;
    let (hour, minute) = clock.split_once(':')?;
    let mut parts = date.split('/');
    let day: u8 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let year: i32 = parts.next()?.parse().ok()?;
    let date = Date::from_calendar_date(2000 + year, Month::try_from(month).ok()?, day).ok()?;
    let time = Time::from_hms(hour.parse().ok()?, minute.parse().ok()?, 0).ok()?;
    Some(PrimitiveDateTime::new(date, time))
}

#[cfg(test)]
mod tests {
    use super::*;

    use regex::Regex;

    #[test]
    fn seconds_roundtrip() {
        assert_eq!(600, get_seconds("10:00").unwrap());
        assert_eq!(3601, get_seconds("60:01").unwrap());
        assert_eq!(u64::MAX, get_seconds("").unwrap());
        assert!(get_seconds("ten").is_err());
        assert_eq!("02:00", format_seconds(61.0));
        assert_eq!("61:00", format_seconds(3600.0));
    }

    #[test]
    fn budgets() {
        assert_eq!("10:00", phase_time_budget(Phase::Scan));
        assert_eq!("60:00", phase_time_budget(Phase::Compute));
        assert_eq!("30:00", phase_time_budget(Phase::Validate));
    }

    #[test]
    fn float_formatting() {
        assert_eq!(Some("1.50 GB".to_string()), format_float(1.5e9));
        assert_eq!(Some("999.00 B".to_string()), format_float(999.0));
        assert_eq!(None, format_float(0.0));
        assert_eq!(Some(1.5e9), deformat_float("1.50 GB"));
        assert_eq!(None, deformat_float("lots"));
    }

    #[test]
    fn string_formatting() {
        assert_eq!("abc  ", format_str("abc", 5, false));
        assert_eq!("abcdefg...", format_str("abcdefghijklmnop", 10, true));
        assert_eq!("abcde", format_str("abcdefgh", 5, false));
    }

    #[test]
    fn closest_divisor() {
        assert_eq!(10, find_closest(100, 9.0));
        assert_eq!(1, find_closest(7, 2.0));
        assert_eq!(7, find_closest(7, 6.0));
        assert_eq!(12, find_closest(360, 12.4));
        assert_eq!(0, find_closest(0, 3.0));
    }

    #[test]
    fn timestamps() {
        let stamp = status_timestamp(now());
        let re = Regex::new(r"^\d{2}:\d{2} \d{2}/\d{2}/\d{2}$").unwrap();
        assert!(re.is_match(&stamp), "{}", stamp);
        let parsed = parse_status_timestamp("13:45 02/03/24").unwrap();
        assert_eq!(2024, parsed.year());
        assert_eq!(Month::March, parsed.month());
        assert_eq!(2, parsed.day());
        assert_eq!(13, parsed.hour());
        assert!(parse_status_timestamp("garbage").is_none());
    }
}
