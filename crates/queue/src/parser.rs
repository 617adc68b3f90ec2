//! Parse queue message bodies into [`JobRecord`]s.

use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use feedsync_core::job::{JobRecord, JobStatus, FEATURE_SCRAPER};

use crate::consumer::QueueMessage;
use crate::error::QueueError;

/// Well-known field names for the job id (tried in order).
const ID_KEYS: &[&str] = &["job_id", "jobId", "id"];

const START_KEYS: &[&str] = &["s_date", "sDate", "start", "from"];

const END_KEYS: &[&str] = &["e_date", "eDate", "end", "to"];

/// Accepted wall-clock layouts for job dates.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

fn parse_wall_clock(s: &str) -> Option<NaiveDateTime> {
    let trimmed = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(trimmed, f).ok())
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(chrono::NaiveTime::MIN))
        })
}

fn probe_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
}

fn required_date(
    obj: &Map<String, Value>,
    keys: &[&str],
    msg_id: &str,
) -> Result<NaiveDateTime, QueueError> {
    let field = keys[0];
    let raw = probe_str(obj, keys)
        .ok_or_else(|| QueueError::Malformed(format!("Message {msg_id} is missing {field}")))?;
    parse_wall_clock(raw).ok_or_else(|| {
        QueueError::Malformed(format!("Message {msg_id} has unparseable {field}: {raw}"))
    })
}

/// Parse a single queue message body into a [`JobRecord`].
///
/// - **job_id**: `job_id`, `jobId` or `id`; must be a UUID
/// - **feed_id**: integer, or a string holding one
/// - **s_date / e_date**: wall-clock time, ISO `T` or space separated,
///   seconds optional, bare dates mean midnight
/// - **scraper_kind**, **status**, **worker_ip**: optional
pub fn parse_job_record(msg: &QueueMessage) -> Result<JobRecord, QueueError> {
    let json: Value = serde_json::from_str(&msg.body)
        .map_err(|e| QueueError::Malformed(format!("Invalid JSON in message {}: {}", msg.id, e)))?;

    let obj = json.as_object().ok_or_else(|| {
        QueueError::Malformed(format!("Message {} body is not a JSON object", msg.id))
    })?;

    let job_id = probe_str(obj, ID_KEYS)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| QueueError::Malformed(format!("Message {} has no valid job_id", msg.id)))?;

    let feed_id = match obj.get("feed_id") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| QueueError::Malformed(format!("Message {} has no valid feed_id", msg.id)))?;

    let s_date = required_date(obj, START_KEYS, &msg.id)?;
    let e_date = required_date(obj, END_KEYS, &msg.id)?;

    let status = match obj.get("status").and_then(|v| v.as_str()) {
        Some(s) => s
            .parse::<JobStatus>()
            .map_err(|e| QueueError::Malformed(format!("Message {}: {}", msg.id, e)))?,
        None => JobStatus::Created,
    };

    Ok(JobRecord {
        job_id,
        feed_id,
        s_date,
        e_date,
        scraper_kind: obj
            .get("scraper_kind")
            .and_then(|v| v.as_str())
            .unwrap_or(FEATURE_SCRAPER)
            .to_string(),
        status,
        worker_ip: obj
            .get("worker_ip")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

/// Serialize a job record for [`crate::QueueProducer::send`].
pub fn encode_job_record(record: &JobRecord) -> Result<String, QueueError> {
    record.to_json().map_err(|e| QueueError::Malformed(e.to_string()))
}

/// Parse a batch of messages, separating successes from failures.
///
/// Returns `(records, errors)`. Good messages are never blocked by bad ones.
pub fn parse_batch(
    messages: &[QueueMessage],
) -> (Vec<(QueueMessage, JobRecord)>, Vec<(QueueMessage, QueueError)>) {
    let mut records = Vec::with_capacity(messages.len());
    let mut errors = Vec::new();

    for msg in messages {
        match parse_job_record(msg) {
            Ok(rec) => records.push((msg.clone(), rec)),
            Err(e) => {
                warn!(message_id = %msg.id, error = %e, "Failed to parse queue message");
                errors.push((msg.clone(), e));
            }
        }
    }

    (records, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    const JOB: &str = "550e8400-e29b-41d4-a716-446655440000";

    /// Helper: build a QueueMessage with the given JSON body.
    fn make_msg(id: &str, body: &str) -> QueueMessage {
        QueueMessage {
            id: id.to_string(),
            body: body.to_string(),
            receipt_handle: "handle-test".to_string(),
            enqueued_at: Utc::now(),
            deliveries: 1,
        }
    }

    fn midnight(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_flat_record() {
        let body = format!(
            r#"{{"job_id":"{JOB}","feed_id":12,
                "s_date":"2024-01-01 00:00:00","e_date":"2024-01-10T00:00:00",
                "scraper_kind":"feature","status":"created","worker_ip":"10.0.0.4"}}"#
        );
        let rec = parse_job_record(&make_msg("msg-1", &body)).unwrap();
        assert_eq!(rec.job_id, Uuid::parse_str(JOB).unwrap());
        assert_eq!(rec.feed_id, 12);
        assert_eq!(rec.s_date, midnight(2024, 1, 1));
        assert_eq!(rec.e_date, midnight(2024, 1, 10));
        assert_eq!(rec.worker_ip.as_deref(), Some("10.0.0.4"));
    }

    #[test]
    fn test_parse_loose_fields() {
        let body = format!(
            r#"{{"id":"{JOB}","feed_id":"5","start":"2024-03-01","end":"2024-03-02 13:45"}}"#
        );
        let rec = parse_job_record(&make_msg("msg-2", &body)).unwrap();
        assert_eq!(rec.feed_id, 5);
        assert_eq!(rec.s_date, midnight(2024, 3, 1));
        assert_eq!(
            rec.e_date,
            NaiveDate::from_ymd_opt(2024, 3, 2).unwrap().and_hms_opt(13, 45, 0).unwrap()
        );
        assert_eq!(rec.scraper_kind, FEATURE_SCRAPER);
        assert_eq!(rec.status, JobStatus::Created);
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = parse_job_record(&make_msg("msg-bad-json", "not json at all")).unwrap_err();
        assert!(matches!(err, QueueError::Malformed(_)));
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[test]
    fn test_parse_missing_fields() {
        let no_feed =
            format!(r#"{{"job_id":"{JOB}","s_date":"2024-01-01","e_date":"2024-01-02"}}"#);

        let err = parse_job_record(&make_msg("m", &no_feed)).unwrap_err();
        assert!(err.to_string().contains("feed_id"));

        let bad_date = format!(
            r#"{{"job_id":"{JOB}","feed_id":1,"s_date":"yesterday","e_date":"2024-01-02"}}"#
        );
        let err = parse_job_record(&make_msg("m", &bad_date)).unwrap_err();
        assert!(err.to_string().contains("s_date"));

        let no_id = r#"{"feed_id":1,"s_date":"2024-01-01","e_date":"2024-01-02"}"#;
        assert!(parse_job_record(&make_msg("m", no_id)).is_err());
    }

    #[test]
    fn test_encode_then_parse() {
        let rec = JobRecord {
            job_id: Uuid::new_v4(),
            feed_id: 99,
            s_date: midnight(2023, 6, 1),
            e_date: midnight(2023, 6, 30),
            scraper_kind: FEATURE_SCRAPER.to_string(),
            status: JobStatus::Created,
            worker_ip: None,
        };
        let body = encode_job_record(&rec).unwrap();
        assert_eq!(parse_job_record(&make_msg("m", &body)).unwrap(), rec);
    }

    #[test]
    fn test_parse_batch_partial_success() {
        let good = format!(
            r#"{{"job_id":"{JOB}","feed_id":1,"s_date":"2024-01-01","e_date":"2024-01-02"}}"#
        );

        let messages = vec![
            make_msg("good-1", &good),
            make_msg("bad-1", "invalid json"),
            make_msg("bad-2", "[1,2,3]"),
        ];

        let (records, errors) = parse_batch(&messages);

        assert_eq!(records.len(), 1);
        assert_eq!(errors.len(), 2);
        assert_eq!(records[0].0.id, "good-1");
        assert_eq!(errors[1].0.id, "bad-2");
    }
}
