//! Expected-timestamp grid and gap detection.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;

use feedsync_core::tz::{to_local, to_utc, utc_candidates};

const DAY_MINUTES: i32 = 1440;

/// Expected instants from `start` (source-local) through `through` at `freq_minutes`.
///
/// Sub-daily feeds step in absolute time so DST transitions neither invent nor
/// hide points. Daily and coarser feeds step on the local calendar.
pub fn expected_grid(
    start: NaiveDateTime,
    freq_minutes: i32,
    tz: Tz,
    through: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {

    let freq = freq_minutes.max(1);
    let mut grid = Vec::new();

    if freq < DAY_MINUTES {
        let Some(mut cursor) = to_utc(tz, start) else {
            return grid;
        };
        let step = Duration::minutes(i64::from(freq));
        while cursor <= through {
            grid.push(cursor);
            cursor += step;
        }
    } else {
        let step = Duration::days(i64::from(freq / DAY_MINUTES));
        let through_local = to_local(tz, through);
        let mut cursor = start;
        while cursor <= through_local {
            if let Some(instant) = utc_candidates(tz, cursor).first() {
                grid.push(*instant);
            }
            cursor += step;
        }
    }
    grid
}

/// Grid points absent from `present`, up to the latest present timestamp.
pub fn find_missing(
    start: NaiveDateTime,
    freq_minutes: i32,
    tz: Tz,
    present: &[DateTime<Utc>],
) -> Vec<DateTime<Utc>> {
    let Some(latest) = present.iter().max().copied() else {
        return Vec::new();
    };
    let have: BTreeSet<DateTime<Utc>> = present.iter().copied().collect();
    expected_grid(start, freq_minutes, tz, latest)
        .into_iter()
        .filter(|ts| !have.contains(ts))
        .collect()
}
