//! Text parsers for the loosely formatted values printed on listing cards.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Format of the posted-at tooltip, e.g. `15:20 10.01.2025`.
pub const POSTED_AT_FORMAT: &str = "%H:%M %d.%m.%Y";

static FIRST_INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));
static LEADING_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:[.,]\d+)?").expect("valid regex"));

/// First run of digits in `text`, or 0 when there is none (or it overflows).
pub fn first_integer(text: &str) -> i32 {
    FIRST_INTEGER
        .find(text)
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .unwrap_or(0)
}

/// Parses the posted-at tooltip in the process-local timezone.
///
/// Never fails: empty, malformed or nonexistent local times resolve to `now`.
pub fn parse_posted_at(text: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let text = text.trim();
    if text.is_empty() {
        return now;
    }

    match NaiveDateTime::parse_from_str(text, POSTED_AT_FORMAT) {
        Ok(naive) => match Local.from_local_datetime(&naive).earliest() {
            Some(local) => local.with_timezone(&Utc),
            None => {
                tracing::warn!("Posted-at '{}' does not exist in local time, using now", text);
                now
            }
        },
        Err(e) => {
            tracing::warn!("Failed to parse posted-at '{}': {}, using now", text, e);
            now
        }
    }
}

/// Years of experience from text like "3 years of experience" or "1.5 years".
///
/// Text without any number ("No experience") counts as zero years.
pub fn parse_experience_years(text: &str) -> f64 {
    LEADING_NUMBER
        .find(text)
        .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok())
        .filter(|years| years.is_finite())
        .unwrap_or(0.0)
}
