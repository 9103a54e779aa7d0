//! Rate-limit detection and reset-time parsing.
//!
//! Vendors phrase their limit messages differently; the detector matches
//! the known family of phrasings without firing on incidental mentions of
//! rate limiting in code or prose the agent echoes back.
//!
//! Two reset-time strategies are tried in order:
//! 1. clock style - "resets 7pm (Europe/Berlin)", "resets 3:30am"
//! 2. duration style - "try again in 5 days 27 minutes"
//!
//! Callers add [`RATE_LIMIT_BUFFER_SECS`] and cap the wait; when neither
//! strategy parses, [`backoff_delay_secs`] supplies a bounded schedule.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use rand::Rng;
use regex::Regex;
use std::sync::LazyLock;

/// Safety margin added on top of a parsed reset time.
pub const RATE_LIMIT_BUFFER_SECS: u64 = 120;

/// Default ceiling for a single cooldown wait (6 hours).
pub const DEFAULT_MAX_WAIT_SECS: u64 = 6 * 60 * 60;

/// Fallback schedule indexed by attempt number, capped at the last entry.
const BACKOFF_SCHEDULE_SECS: [u64; 4] = [120, 300, 900, 1800];

static RATE_LIMIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)hit your limit",
        r"(?i)usage limit.*resets",
        r"(?i)rate limit exceeded",
        r"(?i)rate.limited",
        r"(?i)rate_limit",
        r"(?i)try again in \d+\s*(?:day|hour|minute)s?",
        r"(?i)upgrade to pro",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static CLOCK_RESET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)resets?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?(?:\s*\(([A-Za-z_]+(?:/[A-Za-z0-9_+\-]+)*)\))?",
    )
    .unwrap()
});

static DURATION_RESET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)try again in\s+(?:(\d+)\s*days?)?\s*(?:(\d+)\s*hours?)?\s*(?:(\d+)\s*min(?:ute)?s?)?",
    )
    .unwrap()
});

/// Whether the output looks like a vendor rate-limit message.
pub fn is_rate_limit_message(text: &str) -> bool {
    RATE_LIMIT_PATTERNS.iter().any(|p| p.is_match(text))
}

/// Parse a reset time into seconds-from-`now`.
///
/// Clock style is tried first, then duration style. Returns `None` when
/// neither parses; the caller falls back to the backoff schedule.
pub fn parse_reset_wait(text: &str, now: DateTime<Utc>) -> Option<u64> {
    parse_clock_reset(text, now).or_else(|| parse_duration_reset(text))
}

fn parse_clock_reset(text: &str, now: DateTime<Utc>) -> Option<u64> {
    let caps = CLOCK_RESET_REGEX.captures(text)?;

    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = caps
        .get(2)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);
    if hour > 23 || minute > 59 {
        return None;
    }
    match caps.get(3).map(|m| m.as_str().to_lowercase()) {
        Some(ref meridiem) if meridiem == "pm" && hour < 12 => hour += 12,
        Some(ref meridiem) if meridiem == "am" && hour == 12 => hour = 0,
        _ => {}
    }

    // Invalid or absent timezone falls back to local time.
    match caps.get(4).and_then(|m| m.as_str().parse::<Tz>().ok()) {
        Some(tz) => seconds_until(&tz, now, hour, minute),
        None => seconds_until(&chrono::Local, now, hour, minute),
    }
}

/// Seconds from `now` until the next `hour:minute` wall-clock time in
/// `tz`; rolls over to tomorrow when the time has already passed.
fn seconds_until<T: TimeZone>(tz: &T, now: DateTime<Utc>, hour: u32, minute: u32) -> Option<u64> {
    let now_local = now.with_timezone(tz);
    let naive = now_local.date_naive().and_hms_opt(hour, minute, 0)?;
    let target = tz.from_local_datetime(&naive).earliest()?;
    let mut diff = target.with_timezone(&Utc) - now;
    if diff.num_seconds() < 0 {
        diff += chrono::Duration::hours(24);
    }
    u64::try_from(diff.num_seconds()).ok()
}

fn parse_duration_reset(text: &str) -> Option<u64> {
    let caps = DURATION_RESET_REGEX.captures(text)?;
    let days: u64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let hours: u64 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let minutes: u64 = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    if days == 0 && hours == 0 && minutes == 0 {
        return None;
    }
    Some(days * 86_400 + hours * 3_600 + minutes * 60)
}

/// Add the safety buffer and clamp into `[0, max_wait_secs]`.
pub fn wait_with_buffer(raw_secs: u64, max_wait_secs: u64) -> u64 {
    raw_secs.saturating_add(RATE_LIMIT_BUFFER_SECS).min(max_wait_secs)
}

/// Bounded backoff for unparseable limit messages: schedule entry for
/// `attempt` (clamped to the last) plus 0–30 s of jitter.
pub fn backoff_delay_secs(attempt: u32) -> u64 {
    let idx = (attempt as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    let jitter = rand::rng().random_range(0..=30);
    BACKOFF_SCHEDULE_SECS[idx] + jitter
}
