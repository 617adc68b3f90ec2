use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Scraper kind carried on every job record; the engine only runs feature pulls.
pub const FEATURE_SCRAPER: &str = "feature";

/// Lifecycle of a sync job. Transitions only move forward:
/// `created -> running -> complete | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Half-open range of source-local wall-clock time, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DateWindow {
    /// Build a window, rejecting empty or inverted ranges.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, CoreError> {
        if start >= end {
            return Err(CoreError::InvalidWindow {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn duration(&self) -> chrono::TimeDelta {
        self.end - self.start
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Flat job record placed on the work queue.
///
/// Dates are source-local wall-clock times; the worker resolves the feed's
/// timezone when it loads rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub feed_id: i64,
    pub s_date: NaiveDateTime,
    pub e_date: NaiveDateTime,
    #[serde(default = "default_scraper_kind")]
    pub scraper_kind: String,
    #[serde(default = "default_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub worker_ip: Option<String>,
}

fn default_scraper_kind() -> String {
    FEATURE_SCRAPER.to_string()
}

fn default_status() -> JobStatus {
    JobStatus::Created
}

impl JobRecord {
    pub fn window(&self) -> DateWindow {
        DateWindow {
            start: self.s_date,
            end: self.e_date,
        }
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::Serialize(e.to_string()))
    }
}
