//! Source timezone handling.
//!
//! The upstream API speaks each stream's local time. Feeds declare their
//! timezone either as an IANA name or as one of the market shorthands
//! (`CPT`, `EPT`, `MPT`, `PPT`).

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::CoreError;

const TZ_ALIASES: &[(&str, &str)] = &[
    ("CPT", "US/Central"),
    ("EPT", "US/Eastern"),
    ("MPT", "US/Mountain"),
    ("PPT", "US/Pacific"),
    ("GMT", "UTC"),
];

/// Resolve a feed's declared timezone to a [`Tz`].
pub fn resolve_timezone(name: &str) -> Result<Tz, CoreError> {
    let trimmed = name.trim();
    let canonical = TZ_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
        .map(|(_, iana)| *iana)
        .unwrap_or(trimmed);
    canonical
        .parse::<Tz>()
        .map_err(|_| CoreError::UnknownTimezone(name.to_string()))
}

/// Drop seconds and sub-second precision; the upstream API rejects them.
pub fn floor_to_minute(dt: NaiveDateTime) -> NaiveDateTime {
    dt.with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

/// Truncate to local midnight.
pub fn floor_to_day(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date().and_time(chrono::NaiveTime::MIN)
}

/// Wall-clock time in `tz` at the instant `now`, floored to the minute.
pub fn local_now(tz: Tz, now: DateTime<Utc>) -> NaiveDateTime {
    floor_to_minute(now.with_timezone(&tz).naive_local())
}

/// Convert a UTC instant to the wall-clock time of `tz`.
pub fn to_local(tz: Tz, instant: DateTime<Utc>) -> NaiveDateTime {
    instant.with_timezone(&tz).naive_local()
}

/// Every UTC instant a local wall-clock time can denote.
///
/// Empty inside a spring-forward gap, two entries inside a fall-back overlap
/// (earliest first).
pub fn utc_candidates(tz: Tz, local: NaiveDateTime) -> Vec<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => vec![dt.with_timezone(&Utc)],
        LocalResult::Ambiguous(a, b) => vec![a.with_timezone(&Utc), b.with_timezone(&Utc)],
        LocalResult::None => Vec::new(),
    }
}

/// Localize to UTC, taking the earlier instant for ambiguous wall-clock times.
pub fn to_utc(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    utc_candidates(tz, local).into_iter().next()
}
