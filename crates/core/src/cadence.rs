//! Native data intervals and the per-interval request limits derived from them.

/// Canonical update intervals, in minutes, that cadence estimates snap to.
pub const CANONICAL_INTERVALS: [i32; 5] = [1, 5, 15, 60, 1440];

/// Maximum days of data requested in one upstream call, keyed by the
/// feed's native interval in minutes.
const MAX_DAYS_PER_CALL: &[(i32, i64)] = &[
    (1, 60),
    (5, 300),
    (15, 900),
    (30, 1800),
    (60, 1800),
    (1440, 1800),
];

/// Days per upstream call for a feed with the given native interval.
///
/// Intervals not in the table use the entry for the largest listed interval
/// that does not exceed them, so an unusual 10-minute feed is treated like a
/// 5-minute one.
pub fn max_days_per_call(freq_minutes: i32) -> i64 {
    MAX_DAYS_PER_CALL
        .iter()
        .rev()
        .find(|(minutes, _)| *minutes <= freq_minutes)
        .map(|(_, days)| *days)
        .unwrap_or(MAX_DAYS_PER_CALL[0].1)
}

/// Snap an observed average interval to the nearest canonical interval.
pub fn round_to_canonical(minutes: f64) -> i32 {
    let mut best = CANONICAL_INTERVALS[0];
    let mut best_dist = f64::MAX;
    for candidate in CANONICAL_INTERVALS {
        let dist = (candidate as f64 - minutes).abs();
        if dist < best_dist {
            best = candidate;
            best_dist = dist;
        }
    }
    best
}

/// Extract the leading integer of a frequency label such as `"15min"` or `"60"`.
pub fn parse_freq_minutes(label: &str) -> Option<i32> {
    let digits: String = label
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
