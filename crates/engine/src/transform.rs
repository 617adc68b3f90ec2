//! Turn raw upstream rows into warehouse rows.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use serde_json::Value;
use tracing::debug;

use feedsync_core::tz::utc_candidates;
use feedsync_upstream::payload::parse_local_timestamp;

use crate::error::UpstreamDataError;
use crate::store::StagedRow;

/// Feature streams are `(timestamp, value)` pairs.
pub const EXPECTED_COLUMNS: usize = 2;

/// Cell contents that mean "no value".
const SENTINELS: &[&str] = &["", "n/a", "na", "nan", "null", "none", "-", "--"];

#[derive(Debug, Default)]
pub struct Transformed {
    /// Sorted by UTC timestamp.
    pub rows: Vec<StagedRow>,
    pub dropped_empty: usize,
    /// Wall-clock times skipped by a spring-forward transition.
    pub dropped_nonexistent: usize,
}

fn is_sentinel(cell: &Value) -> bool {
    match cell {
        Value::Null => true,
        Value::String(s) => SENTINELS.contains(&s.trim().to_ascii_lowercase().as_str()),
        _ => false,
    }
}

fn coerce_value(cell: &Value) -> Option<f64> {
    let value = match cell {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

fn coerce_timestamp(cell: &Value) -> Option<NaiveDateTime> {
    match cell {
        Value::String(s) => parse_local_timestamp(s),
        _ => None,
    }
}

/// Validate, clean and localize rows from the feed's source timezone to UTC.
///
/// Inside a fall-back overlap the first occurrence of a wall-clock time maps
/// to the earlier instant and a repeat to the later one.
pub fn transform_rows(rows: &[Vec<Value>], tz: Tz) -> Result<Transformed, UpstreamDataError> {
    let mut out = Transformed::default();
    let mut seen: HashMap<NaiveDateTime, usize> = HashMap::new();

    for (i, row) in rows.iter().enumerate() {
        if row.len() != EXPECTED_COLUMNS {
            return Err(UpstreamDataError::SchemaMismatch {
                expected: EXPECTED_COLUMNS,
                actual: row.len(),
            });
        }
        let local = coerce_timestamp(&row[0]).ok_or_else(|| UpstreamDataError::Malformed {
            row: i,
            detail: format!("unparseable timestamp {}", row[0]),
        })?;
        if is_sentinel(&row[1]) {
            out.dropped_empty += 1;
            continue;
        }
        let value = coerce_value(&row[1]).ok_or_else(|| UpstreamDataError::Malformed {
            row: i,
            detail: format!("non-numeric value {}", row[1]),
        })?;

        let candidates = utc_candidates(tz, local);
        let occurrence = seen.entry(local).or_insert(0);
        let ts = match candidates.as_slice() {
            [] => {
                out.dropped_nonexistent += 1;
                continue;
            }
            [only] => *only,
            [earliest, rest @ ..] => {
                if *occurrence == 0 {
                    *earliest
                } else {
                    rest.last().copied().unwrap_or(*earliest)
                }
            }
        };
        *occurrence += 1;
        out.rows.push(StagedRow {
            ts,
            local_ts: local,
            value,
        });
    }

    out.rows.sort_by_key(|r| (r.ts, r.local_ts));
    debug!(
        rows = out.rows.len(),
        dropped_empty = out.dropped_empty,
        dropped_nonexistent = out.dropped_nonexistent,
        "rows transformed"
    );
    Ok(out)
}
