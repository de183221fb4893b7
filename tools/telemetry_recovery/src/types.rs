use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Foreground,
    Background,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Background => "background",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "foreground" => Some(Self::Foreground),
            "background" => Some(Self::Background),
            _ => None,
        }
    }
}

/// A persisted telemetry session. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub process_id: String,
    pub state: SessionState,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub last_heartbeat_time: i64,
    pub crash_report_id: Option<String>,
    pub cold_start: bool,
    pub clean_exit: bool,
    pub app_terminated: bool,
    pub properties: BTreeMap<String, String>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, start_time: i64) -> Self {
        Self {
            id: id.into(),
            process_id: String::new(),
            state: SessionState::Foreground,
            start_time,
            end_time: None,
            last_heartbeat_time: start_time,
            crash_report_id: None,
            cold_start: false,
            clean_exit: false,
            app_terminated: false,
            properties: BTreeMap::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Links this session to a crash report, moving the end time forward to the
    /// crash timestamp when that timestamp is known and later than the current one.
    pub fn apply_crash(&mut self, report: &CrashReport) {
        if let Some(crashed_at) = report.timestamp {
            let advance = match self.end_time {
                Some(end) => crashed_at > end,
                None => true,
            };
            if advance {
                self.end_time = Some(crashed_at);
            }
        }
        self.crash_report_id = Some(report.id.to_string());
    }
}

/// An unsent crash report as offered by a crash source.
#[derive(Debug, Clone, PartialEq)]
pub struct CrashReport {
    pub id: Uuid,
    pub native_id: String,
    pub session_id: Option<String>,
    pub timestamp: Option<i64>,
    pub provider: String,
    pub report: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    CrashReport,
    Session,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CrashReport => "crash_report",
            Self::Session => "session",
        }
    }
}
