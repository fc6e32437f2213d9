//! Naive local calendar arithmetic over `Ms` timestamps.
//!
//! Timestamps never carry a timezone: a booking at "10:00" is stored as the
//! millisecond value of 10:00 UTC on that date and always rendered back as
//! 10:00.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::model::*;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

pub fn to_naive(ms: Ms) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

pub fn from_naive(dt: &NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

/// Midnight at the start of `date`.
pub fn day_start(date: NaiveDate) -> Ms {
    from_naive(&date.and_time(NaiveTime::MIN))
}

pub fn date_of(ms: Ms) -> Option<NaiveDate> {
    to_naive(ms).map(|dt| dt.date())
}

/// Monday = 0 .. Sunday = 6.
pub fn weekday_index(date: NaiveDate) -> usize {
    date.weekday().num_days_from_monday() as usize
}

/// Monday of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - chrono::Duration::days(weekday_index(date) as i64)
}

pub fn minute_of_day(ms: Ms) -> Option<u32> {
    to_naive(ms).map(|dt| dt.hour() * 60 + dt.minute())
}

/// Parse a naive local timestamp such as `2030-01-07T10:30`.
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    let s = s.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| from_naive(&dt))
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Parse `HH:MM` into minutes from midnight. `24:00` is accepted as end of day.
pub fn parse_clock(s: &str) -> Option<u32> {
    let s = s.trim();
    if s == "24:00" {
        return Some(24 * 60);
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M").ok()?;
    Some(t.hour() * 60 + t.minute())
}

pub fn format_clock(minute_of_day: u32) -> String {
    format!("{:02}:{:02}", minute_of_day / 60, minute_of_day % 60)
}

/// Label of an instant within the day that starts at `day_start_ms`, e.g. `09:30`.
/// The end of the day renders as `24:00`.
pub fn clock_label(day_start_ms: Ms, instant: Ms) -> String {
    let minutes = (instant - day_start_ms).div_euclid(MINUTE_MS);
    format_clock(minutes.clamp(0, 24 * 60) as u32)
}

pub fn format_instant(ms: Ms) -> String {
    to_naive(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Human-readable window: `2030-01-07 10:00 to 11:00`, or with both dates
/// when it crosses midnight.
pub fn describe_window(span: &Span) -> String {
    match (to_naive(span.start), to_naive(span.end)) {
        (Some(s), Some(e)) if s.date() == e.date() => {
            format!("{} to {}", s.format("%Y-%m-%d %H:%M"), e.format("%H:%M"))
        }
        _ => format!("{} to {}", format_instant(span.start), format_instant(span.end)),
    }
}

/// Parse a weekday hours cell: `closed` or `HH:MM-HH:MM`.
pub fn parse_day_hours(s: &str) -> Option<DayHours> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("closed") {
        return Some(DayHours::Closed);
    }
    let (open, close) = s.split_once('-')?;
    let open = parse_clock(open)?;
    let close = parse_clock(close)?;
    (open < close).then_some(DayHours::Open { open, close })
}

pub fn format_day_hours(hours: &DayHours) -> Option<String> {
    match hours {
        DayHours::Unset => None,
        DayHours::Closed => Some("closed".into()),
        DayHours::Open { open, close } => {
            Some(format!("{}-{}", format_clock(*open), format_clock(*close)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_naive_local_timestamps() {
        assert_eq!(parse_timestamp("2030-01-07T00:00"), Some(1_893_974_400_000));
        assert_eq!(parse_timestamp("2030-01-07 10:30:00"), Some(1_893_974_400_000 + 10 * HOUR_MS + 30 * MINUTE_MS));
        assert_eq!(parse_timestamp("2030-01-07T10:30:00.250"), Some(1_893_974_400_000 + 10 * HOUR_MS + 30 * MINUTE_MS + 250));
        assert_eq!(parse_timestamp("07/01/2030 10:30"), None);
        assert_eq!(parse_timestamp("2030-02-30T10:00"), None);
    }

    #[test]
    fn day_and_weekday() {
        let date = parse_date("2030-01-07").unwrap();
        assert_eq!(weekday_index(date), 0); // Monday
        assert_eq!(day_start(date), 1_893_974_400_000);
        assert_eq!(date_of(day_start(date) + 23 * HOUR_MS), Some(date));
        assert_eq!(week_start(parse_date("2030-01-13").unwrap()), date);
    }

    #[test]
    fn clock_parsing_and_labels() {
        assert_eq!(parse_clock("08:30"), Some(510));
        assert_eq!(parse_clock("24:00"), Some(1440));
        assert_eq!(parse_clock("25:00"), None);
        assert_eq!(format_clock(510), "08:30");
        let day = day_start(parse_date("2030-01-07").unwrap());
        assert_eq!(clock_label(day, day + DAY_MS), "24:00");
    }

    #[test]
    fn day_hours_cells() {
        assert_eq!(parse_day_hours("closed"), Some(DayHours::Closed));
        assert_eq!(
            parse_day_hours("07:00-19:30"),
            Some(DayHours::Open { open: 420, close: 1170 })
        );
        assert_eq!(parse_day_hours("19:00-07:00"), None);
        assert_eq!(parse_day_hours("all day"), None);
        assert_eq!(
            format_day_hours(&DayHours::Open { open: 420, close: 1440 }).as_deref(),
            Some("07:00-24:00")
        );
        assert_eq!(format_day_hours(&DayHours::Unset), None);
    }

    #[test]
    fn window_descriptions() {
        let day = day_start(parse_date("2030-01-07").unwrap());
        assert_eq!(
            describe_window(&Span::new(day + 10 * HOUR_MS, day + 11 * HOUR_MS)),
            "2030-01-07 10:00 to 11:00"
        );
        assert_eq!(
            describe_window(&Span::new(day + 23 * HOUR_MS, day + 25 * HOUR_MS)),
            "2030-01-07 23:00 to 2030-01-08 01:00"
        );
    }
}
