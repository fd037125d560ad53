//! Publish-date normalization.
//!
//! Feed producers write `pubDate` in whatever format they like. [`normalize`]
//! tries a fixed list of layouts in order and returns the first one that
//! parses, so the same input always yields the same instant.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use thiserror::Error;
use tracing::trace;

/// None of the known layouts matched. Carries the original text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized date format: {0:?}")]
pub struct UnparseableDate(pub String);

type Layout = fn(&str) -> Option<DateTime<Utc>>;

/// Layouts in the order they are tried.
const LAYOUTS: [(&str, Layout); 10] = [
    ("rfc3339", parse_rfc3339),
    ("date-time", parse_date_time),
    ("iso-date", parse_iso_date),
    ("us-date", parse_us_date),
    ("day-month-year", parse_day_month_year),
    ("rfc1123-numeric-zone", parse_rfc1123_numeric_zone),
    ("rfc1123-named-zone", parse_rfc1123_named_zone),
    ("month-day-year", parse_month_day_year),
    ("rfc822", parse_rfc822),
    ("us-short-date-time", parse_us_short_date_time),
];

/// Convert a textual publish date into a UTC instant.
///
/// Surrounding whitespace is ignored. Never falls back to the current time:
/// what to do with an unparseable date is the caller's decision.
pub fn normalize(text: &str) -> Result<DateTime<Utc>, UnparseableDate> {
    let trimmed = text.trim();

    LAYOUTS
        .iter()
        .find_map(|(name, parse)| {
            let parsed = parse(trimmed)?;
            trace!(layout = *name, input = trimmed, "parsed publish date");
            Some(parsed)
        })
        .ok_or_else(|| UnparseableDate(text.to_string()))
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_date_time(s: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()?;
    four_digit_year(s, naive.year()).then(|| naive.and_utc())
}

fn parse_iso_date(s: &str) -> Option<DateTime<Utc>> {
    midnight(s, "%Y-%m-%d")
}

fn parse_us_date(s: &str) -> Option<DateTime<Utc>> {
    midnight(s, "%m/%d/%Y")
}

fn parse_day_month_year(s: &str) -> Option<DateTime<Utc>> {
    midnight(s, "%d %b %Y")
}

fn parse_rfc1123_numeric_zone(s: &str) -> Option<DateTime<Utc>> {
    let rest = strip_weekday(s)?;
    let local = DateTime::parse_from_str(rest, "%d %b %Y %H:%M:%S %z").ok()?;
    four_digit_year(rest, local.year()).then(|| local.with_timezone(&Utc))
}

fn parse_rfc1123_named_zone(s: &str) -> Option<DateTime<Utc>> {
    let rest = strip_weekday(s)?;
    let local = with_named_zone(rest, "%d %b %Y %H:%M:%S")?;
    four_digit_year(rest, local.year()).then(|| local.with_timezone(&Utc))
}

fn parse_month_day_year(s: &str) -> Option<DateTime<Utc>> {
    midnight(s, "%b %d %Y")
}

fn parse_rfc822(s: &str) -> Option<DateTime<Utc>> {
    with_named_zone(s, "%d %b %y %H:%M").map(|local| local.with_timezone(&Utc))
}

fn parse_us_short_date_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%m/%d/%y %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn midnight(s: &str, format: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, format).ok()?;
    if !four_digit_year(s, date.year()) {
        return None;
    }
    date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc())
}

/// `%Y` takes a year of any width; the layouts using it want exactly four
/// digits, so `01/02/06` is not the year 6.
fn four_digit_year(s: &str, year: i32) -> bool {
    let year = format!("{:04}", year);
    year.len() == 4 && s.split(|c: char| !c.is_ascii_digit()).any(|run| run == year)
}

/// Drop a leading `Mon, ` style weekday. The weekday has to be a real one,
/// but it is not checked against the date; plenty of feeds get it wrong.
fn strip_weekday(s: &str) -> Option<&str> {
    let (day, rest) = s.split_once(", ")?;
    day.parse::<Weekday>().ok()?;
    Some(rest)
}

/// Parse `<local time> <ZONE>` where the zone is an abbreviation.
fn with_named_zone(s: &str, format: &str) -> Option<DateTime<FixedOffset>> {
    let (local, zone) = s.rsplit_once(' ')?;
    let offset = zone_offset(zone)?;
    let naive = NaiveDateTime::parse_from_str(local, format).ok()?;

    offset.from_local_datetime(&naive).single()
}

/// Offsets for the zone names RFC 822 defines. Any other short alphabetic
/// abbreviation is read as UTC.
fn zone_offset(zone: &str) -> Option<FixedOffset> {
    let hours = match zone {
        "UT" | "UTC" | "GMT" | "Z" => 0,
        "EDT" => -4,
        "EST" | "CDT" => -5,
        "CST" | "MDT" => -6,
        "MST" | "PDT" => -7,
        "PST" => -8,
        other if (1..=5).contains(&other.len()) && other.chars().all(|c| c.is_ascii_alphabetic()) => {
            0
        }
        _ => return None,
    };

    FixedOffset::east_opt(hours * 3600)
}
