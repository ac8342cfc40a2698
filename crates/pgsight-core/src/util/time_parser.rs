//! Time expressions accepted on the command line.
//!
//! | Format | Example |
//! |--------|---------|
//! | RFC 3339 | `2026-02-07T17:00:00.250000Z` |
//! | ISO 8601, UTC | `2026-02-07T17:00:00`, `2026-02-07T17:00` |
//! | Unix seconds | `1738944000`, `1738944000.5` |
//! | Relative | `-1h`, `-30m`, `-2d`, `-1w`, `-90s`, `now` |
//! | Date:time, UTC | `2026-02-07:07:00`, `2026-02-07:07:00:00` |
//! | Time only, UTC | `07:00` (on the reference day) |
//!
//! Everything resolves to a microsecond [`Timestamp`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::model::{MICROS_PER_SEC, TimeRange, Timestamp};

/// Error type for time parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeParseError {
    pub input: String,
    pub message: String,
}

impl TimeParseError {
    fn new(input: &str, message: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TimeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to parse time '{}': {}", self.input, self.message)
    }
}

impl std::error::Error for TimeParseError {}

/// Parses `input` relative to the current time.
pub fn parse_time(input: &str) -> Result<Timestamp, TimeParseError> {
    parse_time_at(input, Timestamp::from_datetime(Utc::now()))
}

/// Parses `input`; relative and time-only forms resolve against `base`.
pub fn parse_time_at(input: &str, base: Timestamp) -> Result<Timestamp, TimeParseError> {
    let input = input.trim();

    if input == "now" {
        return Ok(base);
    }
    if let Some(ts) = unix_seconds(input) {
        return Ok(ts);
    }
    if let Some(delta) = relative_micros(input) {
        return base
            .as_micros()
            .checked_sub(delta)
            .map(Timestamp::from_micros)
            .ok_or_else(|| TimeParseError::new(input, "relative time overflow"));
    }
    if let Some(ts) = iso8601(input).or_else(|| date_colon_time(input)) {
        return Ok(ts);
    }
    if let Some(ts) = time_on_day_of(input, base) {
        return Ok(ts);
    }

    Err(TimeParseError::new(
        input,
        "unrecognized format. Use: ISO 8601 (2026-02-07T17:00:00), \
         Unix seconds (1738944000), relative (-1h, -30m, -2d, now), \
         date:time (2026-02-07:07:00), or time only (07:00)",
    ))
}

/// Parses both ends of a range against the same reference time.
pub fn parse_range(from: &str, to: &str) -> Result<TimeRange, TimeParseError> {
    let base = Timestamp::from_datetime(Utc::now());
    let start = parse_time_at(from, base)?;
    let end = parse_time_at(to, base)?;
    TimeRange::new(start, end).ok_or_else(|| {
        TimeParseError::new(to, format!("end {} is before start {}", end, start))
    })
}

/// `1738944000` or `1738944000.123456`.
fn unix_seconds(input: &str) -> Option<Timestamp> {
    let (secs, frac) = match input.split_once('.') {
        Some((s, f)) => (s, f),
        None => (input, ""),
    };
    if secs.is_empty() || !secs.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if frac.len() > 6 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let secs: i64 = secs.parse().ok()?;
    // right-pad the fraction to microseconds
    let micros: i64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<6}", frac).parse().ok()?
    };
    secs.checked_mul(MICROS_PER_SEC)?
        .checked_add(micros)
        .map(Timestamp::from_micros)
}

/// `-1h` → one hour in microseconds.
fn relative_micros(input: &str) -> Option<i64> {
    let rest = input.strip_prefix('-')?;
    let unit = rest.chars().last()?;
    let number: i64 = rest[..rest.len() - unit.len_utf8()].parse().ok()?;
    let secs = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        'w' => 604_800,
        _ => return None,
    };
    number.checked_mul(secs)?.checked_mul(MICROS_PER_SEC)
}

fn iso8601(input: &str) -> Option<Timestamp> {
    if !input.contains('T') {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(Timestamp::from_datetime(dt.with_timezone(&Utc)));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|ndt| Timestamp::from_datetime(Utc.from_utc_datetime(&ndt)))
}

/// `YYYY-MM-DD:HH:MM[:SS]`
fn date_colon_time(input: &str) -> Option<Timestamp> {
    let date_part = input.get(..10)?;
    let time_part = input.get(10..)?.strip_prefix(':')?;
    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    let time = match time_part.len() {
        5 => NaiveTime::parse_from_str(time_part, "%H:%M").ok()?,
        8 => NaiveTime::parse_from_str(time_part, "%H:%M:%S").ok()?,
        _ => return None,
    };
    let ndt = NaiveDateTime::new(date, time);
    Some(Timestamp::from_datetime(Utc.from_utc_datetime(&ndt)))
}

/// `HH:MM` on the UTC day of `base`.
fn time_on_day_of(input: &str, base: Timestamp) -> Option<Timestamp> {
    if input.len() != 5 || input.chars().nth(2) != Some(':') {
        return None;
    }
    let time = NaiveTime::parse_from_str(input, "%H:%M").ok()?;
    let day = base.to_datetime()?.date_naive();
    let ndt = NaiveDateTime::new(day, time);
    Some(Timestamp::from_datetime(Utc.from_utc_datetime(&ndt)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Timestamp {
        Timestamp::from_datetime(Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap())
    }

    #[test]
    fn unix_seconds_keep_fraction() {
        assert_eq!(parse_time("1738944000").unwrap(), Timestamp::from_secs(1738944000));
        assert_eq!(
            parse_time("1738944000.5").unwrap(),
            Timestamp::from_micros(1_738_944_000_500_000)
        );
        assert_eq!(
            parse_time("0.000001").unwrap(),
            Timestamp::from_micros(1)
        );
        assert!(parse_time("1.1234567").is_err());
    }

    #[test]
    fn relative_to_base() {
        let base = utc(2026, 2, 8, 10, 0, 0);
        assert_eq!(parse_time_at("-1h", base).unwrap(), utc(2026, 2, 8, 9, 0, 0));
        assert_eq!(parse_time_at("-2d", base).unwrap(), utc(2026, 2, 6, 10, 0, 0));
        assert_eq!(parse_time_at("-90s", base).unwrap(), utc(2026, 2, 8, 9, 58, 30));
        assert_eq!(parse_time_at("now", base).unwrap(), base);
    }

    #[test]
    fn iso_forms() {
        let expected = utc(2026, 2, 7, 17, 0, 0);
        assert_eq!(parse_time("2026-02-07T17:00:00").unwrap(), expected);
        assert_eq!(parse_time("2026-02-07T17:00").unwrap(), expected);
        assert_eq!(parse_time("2026-02-07T17:00:00Z").unwrap(), expected);
        assert_eq!(parse_time("2026-02-07T19:00:00+02:00").unwrap(), expected);
        assert_eq!(
            parse_time("2026-02-07T17:00:00.250000Z").unwrap(),
            Timestamp::from_micros(expected.as_micros() + 250_000)
        );
    }

    #[test]
    fn date_colon_time_forms() {
        let expected = utc(2026, 2, 7, 17, 0, 0);
        assert_eq!(parse_time("2026-02-07:17:00").unwrap(), expected);
        assert_eq!(parse_time("2026-02-07:17:00:00").unwrap(), expected);
    }

    #[test]
    fn time_only_uses_base_day() {
        let base = utc(2026, 2, 8, 10, 0, 0);
        assert_eq!(parse_time_at("16:00", base).unwrap(), utc(2026, 2, 8, 16, 0, 0));
    }

    #[test]
    fn invalid_inputs() {
        for input in ["", "invalid", "2026-02-07", "-abc", "-1x", "12:34:56:78"] {
            assert!(parse_time(input).is_err(), "{}", input);
        }
    }

    #[test]
    fn range_must_be_ordered() {
        assert!(parse_range("1000", "2000").is_ok());
        let err = parse_range("2000", "1000").unwrap_err();
        assert_eq!(err.input, "1000");
    }
}
