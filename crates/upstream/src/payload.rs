//! JSON envelope returned by the stream-data endpoint.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use feedsync_core::cadence::parse_freq_minutes;

use crate::error::UpstreamError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "unitOfMeasure", default)]
    pub unit_of_measure: Option<String>,
}

/// `metaData` block. Most fields arrive as strings; accessors parse them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(rename = "streamId", default, deserialize_with = "string_or_number")]
    pub stream_id: Option<String>,
    #[serde(rename = "streamName", default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(rename = "dataInterval", default, deserialize_with = "string_or_number")]
    pub data_interval: Option<String>,
    #[serde(rename = "recordCount", default, deserialize_with = "string_or_number")]
    pub record_count: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(rename = "lastUpdatedUTC", default)]
    pub last_updated_utc: Option<String>,
    #[serde(default)]
    pub last_effective: Option<String>,
    #[serde(rename = "dataOption", default)]
    pub data_option: Option<String>,
}

fn string_or_number<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(de)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

const LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m-%d-%Y %H:%M:%S",
];

/// Parse an upstream wall-clock timestamp in any of the layouts it emits.
pub fn parse_local_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    LOCAL_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            ["%m/%d/%Y", "%m-%d-%Y", "%Y-%m-%d"].iter().find_map(|f| {
                chrono::NaiveDate::parse_from_str(s, f)
                    .ok()
                    .map(|d| d.and_time(chrono::NaiveTime::MIN))
            })
        })
}

impl StreamMetadata {
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_updated_utc.as_deref()?.trim();
        DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_local_timestamp(raw).map(|n| n.and_utc()))
    }

    /// Last wall-clock time data is published for, in the stream's timezone.
    pub fn last_effective(&self) -> Option<NaiveDateTime> {
        parse_local_timestamp(self.last_effective.as_deref()?)
    }

    pub fn interval_minutes(&self) -> Option<i32> {
        parse_freq_minutes(self.data_interval.as_deref()?)
    }
}

/// Full response: metadata plus row data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamPayload {
    #[serde(rename = "metaData", default)]
    pub metadata: StreamMetadata,
    #[serde(default)]
    pub data: Vec<Value>,
}

impl StreamPayload {
    pub fn from_json(body: &str) -> Result<Self, UpstreamError> {
        serde_json::from_str(body).map_err(|e| UpstreamError::Parse(format!("stream payload: {e}")))
    }

    /// Rows as positional cells. Object rows are ordered by the metadata columns.
    pub fn rows(&self) -> Vec<Vec<Value>> {
        self.data
            .iter()
            .map(|row| match row {
                Value::Array(cells) => cells.clone(),
                Value::Object(map) if !self.metadata.columns.is_empty() => self
                    .metadata
                    .columns
                    .iter()
                    .map(|c| map.get(&c.name).cloned().unwrap_or(Value::Null))
                    .collect(),
                Value::Object(map) => map.values().cloned().collect(),
                other => vec![other.clone()],
            })
            .collect()
    }

    /// Column count from metadata, falling back to the widest row.
    pub fn column_count(&self) -> usize {
        if !self.metadata.columns.is_empty() {
            return self.metadata.columns.len();
        }
        self.rows().iter().map(Vec::len).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    const SAMPLE: &str = r#"{
        "metaData": {
            "timeGenerated": "2024-04-21T21:11:45.5100134Z",
            "streamName": "ERCOT LZ_WEST Settle Forecast Price",
            "streamId": "352722",
            "timezone": "CPT",
            "dataInterval": "15",
            "recordCount": "2",
            "columns": [
                {"name": "Date/Time", "unitOfMeasure": ""},
                {"name": "Price", "unitOfMeasure": "USD/MWh"}
            ],
            "last_effective": "2024-04-23T00:00:00",
            "dataOption": null,
            "lastUpdatedUTC": "2024-04-21T19:57:58.393Z"
        },
        "data": [["04/01/2024 00:15", 23.5], ["04/01/2024 00:30", ""]]
    }"#;

    #[test]
    fn test_parse_metadata_fields() {
        let payload = StreamPayload::from_json(SAMPLE).unwrap();
        let meta = &payload.metadata;
        assert_eq!(meta.stream_id.as_deref(), Some("352722"));
        assert_eq!(meta.timezone.as_deref(), Some("CPT"));
        assert_eq!(meta.interval_minutes(), Some(15));
        assert_eq!(
            meta.last_effective(),
            Some(NaiveDate::from_ymd_opt(2024, 4, 23).unwrap().and_hms_opt(0, 0, 0).unwrap())
        );
        let updated = meta.last_updated().unwrap();
        assert_eq!(updated.date_naive(), NaiveDate::from_ymd_opt(2024, 4, 21).unwrap());
        assert!(updated > Utc.with_ymd_and_hms(2024, 4, 21, 19, 57, 58).unwrap());
        assert_eq!(payload.column_count(), 2);
    }

    #[test]
    fn test_rows_positional_and_object() {
        let payload = StreamPayload::from_json(SAMPLE).unwrap();
        let rows = payload.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], serde_json::json!(23.5));

        let objects = r#"{"metaData":{"columns":[{"name":"dt"},{"name":"v"}]},
                          "data":[{"v": 1.0, "dt": "2024-01-01 00:00"}]}"#;
        let payload = StreamPayload::from_json(objects).unwrap();
        assert_eq!(payload.rows()[0][0], serde_json::json!("2024-01-01 00:00"));
    }

    #[test]
    fn test_numeric_interval_and_missing_metadata() {
        let payload =
            StreamPayload::from_json(r#"{"metaData":{"dataInterval":60},"data":[]}"#).unwrap();

        assert_eq!(payload.metadata.interval_minutes(), Some(60));
        assert!(payload.metadata.last_updated().is_none());

        let bare = StreamPayload::from_json(r#"{"data":[[1,2,3]]}"#).unwrap();
        assert_eq!(bare.column_count(), 3);
    }

    #[test]
    fn test_parse_local_timestamp_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap().and_hms_opt(13, 5, 0).unwrap();
        assert_eq!(parse_local_timestamp("04/01/2024 13:05"), Some(expected));
        assert_eq!(parse_local_timestamp("2024-04-01T13:05:00"), Some(expected));
        assert_eq!(parse_local_timestamp("2024-04-01 13:05:00"), Some(expected));
        assert!(parse_local_timestamp("04-01-2024").is_some());
        assert!(parse_local_timestamp("soon").is_none());
    }
}
