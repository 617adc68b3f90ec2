//! Date-range computation and job splitting.
//!
//! All windows are in the feed's source-local wall-clock time, which is what
//! the upstream API expects for `fromDate`/`toDate`.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use feedsync_core::tz::{floor_to_day, floor_to_minute, local_now, to_local};
use feedsync_core::{max_days_per_call, DateWindow};

use crate::model::Feed;

/// Which kind of work a feed is scheduled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Steady,
    Catchup,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Steady => "steady",
            Self::Catchup => "catchup",
        }
    }
}

/// Chop `window` into consecutive pieces of at most `max_days` days.
pub fn split_window(window: DateWindow, max_days: i64) -> Vec<DateWindow> {
    let step = Duration::days(max_days.max(1));
    let mut pieces = Vec::new();
    let mut cursor = window.start;
    while cursor < window.end {
        let end = (cursor + step).min(window.end);
        pieces.push(DateWindow { start: cursor, end });
        cursor += step;
    }
    pieces
}

/// Steady-state window: `max(target, last_date)` clamped to now, floored to
/// midnight, up to now floored to the minute.
pub fn steady_window(feed: &Feed, tz: Tz, now: DateTime<Utc>) -> Option<DateWindow> {
    let now_local = local_now(tz, now);
    let start = match feed.last_date {
        Some(last) => feed.sync.target_first_date.max(to_local(tz, last)).min(now_local),
        None => feed.sync.target_first_date.min(now_local),
    };
    DateWindow::new(floor_to_day(start), now_local).ok()
}

/// Catch-up window: `[target, first_date)`, the end floored to the minute.
///
/// A feed with no data yet catches up all the way to now.
pub fn catchup_window(feed: &Feed, tz: Tz, now: DateTime<Utc>) -> Option<DateWindow> {
    let end = match feed.first_date {
        Some(first) => floor_to_minute(to_local(tz, first)),
        None => local_now(tz, now),
    };
    DateWindow::new(feed.sync.target_first_date, end).ok()
}

/// Window for `kind`, split to the feed's per-call limit.
pub fn plan_windows(feed: &Feed, kind: PlanKind, tz: Tz, now: DateTime<Utc>) -> Vec<DateWindow> {
    let window = match kind {
        PlanKind::Steady => steady_window(feed, tz, now),
        PlanKind::Catchup => catchup_window(feed, tz, now),
    };
    window
        .map(|w| split_window(w, max_days_per_call(feed.freq_minutes)))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime, TimeZone};

    use crate::model::{Feed, SyncParams};

    fn d(y: i32, m: u32, day: u32) -> NaiveDateTime {
        at(y, m, day, 0, 0)
    }

    fn at(y: i32, m: u32, day: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, day).unwrap().and_hms_opt(h, min, 0).unwrap()
    }

    fn feed(freq: i32) -> Feed {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Feed {
            id: 7,
            stream_id: 352722,
            perspective: "actual".into(),
            data_option: String::new(),
            iso: "ercot".into(),
            name: None,
            source_tz: "UTC".into(),
            freq_minutes: freq,
            available_from: None,
            first_date: None,
            last_date: None,
            table_name: "ercot_feature".into(),
            active: true,
            created_at: epoch,
            updated_at: epoch,
            sync: SyncParams {
                target_first_date: d(2024, 1, 1),
                sync_active: false,
                sync_every: freq,
                priority: 0,
                last_sync: None,
                last_error: None,
                last_error_at: None,
                next_sync: epoch,
                pending_sync: false,
                catchup_complete: false,
                days_ahead: 0,
                upstream_last_updated: None,
            },
        }
    }

    #[test]
    fn test_split_window_bounds() {
        let w = DateWindow::new(d(2024, 1, 1), d(2024, 1, 10)).unwrap();
        let pieces = split_window(w, 4);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], DateWindow { start: d(2024, 1, 1), end: d(2024, 1, 5) });
        assert_eq!(pieces[2], DateWindow { start: d(2024, 1, 9), end: d(2024, 1, 10) });
        for pair in pieces.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(split_window(w, 60).len(), 1);
    }

    #[test]
    fn test_catchup_window_is_gap_to_first_date() {
        let mut f = feed(1);
        f.first_date = Some(Utc.with_ymd_and_hms(2024, 1, 10, 6, 30, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let w = catchup_window(&f, chrono_tz::UTC, now).unwrap();
        let first = at(2024, 1, 10, 6, 30);
        assert_eq!(w, DateWindow { start: d(2024, 1, 1), end: first });
    }

    #[test]
    fn test_catchup_window_ends_at_local_first_date() {
        let mut f = feed(15);
        // 06:30Z is 00:30 local in Central time; the half hour after midnight stays in range.
        f.first_date = Some(Utc.with_ymd_and_hms(2024, 1, 10, 6, 30, 45).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let w = catchup_window(&f, chrono_tz::US::Central, now).unwrap();
        assert_eq!(w.end, at(2024, 1, 10, 0, 30));
    }

    #[test]
    fn test_catchup_window_empty_when_target_reached() {
        let mut f = feed(15);
        f.first_date = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert!(catchup_window(&f, chrono_tz::UTC, now).is_none());
        assert!(plan_windows(&f, PlanKind::Catchup, chrono_tz::UTC, now).is_empty());
    }

    #[test]
    fn test_steady_window_starts_at_last_date_midnight() {
        let mut f = feed(15);
        f.last_date = Some(Utc.with_ymd_and_hms(2024, 2, 20, 17, 45, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 2, 21, 9, 7, 31).unwrap();
        let w = steady_window(&f, chrono_tz::UTC, now).unwrap();
        assert_eq!(w.start, d(2024, 2, 20));
        assert_eq!(w.end, at(2024, 2, 21, 9, 7));
    }

    #[test]
    fn test_steady_window_in_source_timezone() {
        let mut f = feed(60);
        f.last_date = Some(Utc.with_ymd_and_hms(2024, 2, 21, 3, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 2, 21, 5, 0, 0).unwrap();
        let w = steady_window(&f, chrono_tz::US::Central, now).unwrap();
        // 03:00Z is 21:00 the previous evening in Central time.
        assert_eq!(w.start, d(2024, 2, 20));
        assert_eq!(w.end, at(2024, 2, 20, 23, 0));

    }

    #[test]
    fn test_steady_window_clamps_future_target() {
        let mut f = feed(15);
        f.sync.target_first_date = d(2030, 1, 1);
        let now = Utc.with_ymd_and_hms(2024, 2, 21, 9, 7, 0).unwrap();
        let w = steady_window(&f, chrono_tz::UTC, now).unwrap();
        assert_eq!(w.start, d(2024, 2, 21));
    }

    #[test]
    fn test_one_minute_feed_splits_at_sixty_days() {
        let f = feed(1);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let pieces = plan_windows(&f, PlanKind::Catchup, chrono_tz::UTC, now);
        assert!(pieces.iter().all(|w| w.duration() <= Duration::days(60)));
        assert_eq!(pieces.first().unwrap().start, d(2024, 1, 1));
        assert_eq!(pieces.last().unwrap().end, d(2024, 6, 1));
    }
}
