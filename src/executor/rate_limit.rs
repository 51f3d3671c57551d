//! Usage-limit detection and reset-time parsing for CLI output.
//!
//! The CLI reports rate limiting either with the exact sentinel
//! `Claude AI usage limit reached|<unix-timestamp>` or with looser
//! natural-language phrasing ("please wait 5 minutes"). The sentinel wins;
//! the unit phrases are checked minutes first, then seconds, then hours;
//! with nothing parseable the reset defaults to five minutes from now.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Fallback wait when the output gives no usable reset time.
const DEFAULT_WAIT_SECS: i64 = 300;

/// Substrings that classify output as a usage-limit failure.
const USAGE_LIMIT_MARKERS: &[&str] = &[
    "Claude AI usage limit reached",
    "Request not allowed",
    "usage limit",
    "rate limit",
    "quota exceeded",
];

static SENTINEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Claude AI usage limit reached\|(\d+)").unwrap());

static MINUTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(?:minutes?|mins?)").unwrap());

static SECONDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(?:seconds?|secs?)").unwrap());

static HOURS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(?:hours?|hrs?)").unwrap());

/// Check whether CLI output indicates a usage/rate limit.
pub fn is_usage_limit(output: &str) -> bool {
    USAGE_LIMIT_MARKERS.iter().any(|m| output.contains(m))
}

/// Parse the reset time out of usage-limit output.
pub fn parse_reset_time(output: &str) -> DateTime<Utc> {
    parse_reset_time_at(output, Utc::now())
}

/// Deterministic core of [`parse_reset_time`].
fn parse_reset_time_at(output: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    // The sentinel carries an absolute unix timestamp and overrides any
    // unit phrasing elsewhere in the output.
    if let Some(caps) = SENTINEL_RE.captures(output) {
        if let Some(ts) = caps[1].parse::<i64>().ok().and_then(|ts| DateTime::from_timestamp(ts, 0))
        {
            return ts;
        }
    }

    if let Some(minutes) = capture_number(&MINUTES_RE, output) {
        return now + chrono::Duration::minutes(minutes);
    }

    if let Some(seconds) = capture_number(&SECONDS_RE, output) {
        return now + chrono::Duration::seconds(seconds);
    }

    if let Some(hours) = capture_number(&HOURS_RE, output) {
        return now + chrono::Duration::hours(hours);
    }

    now + chrono::Duration::seconds(DEFAULT_WAIT_SECS)
}

fn capture_number(re: &Regex, output: &str) -> Option<i64> {
    re.captures(output).and_then(|caps| caps[1].parse().ok())
}
