use crate::errors::RecoveryError;
use crate::log_retention::{enforce_total_budget, rotate_if_larger};
use crate::session_store::system_time_unix;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

static RUN_LOG: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
    pub min_level: LogLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            min_level: LogLevel::Info,
        }
    }

    pub fn enabled(&self, level: &str) -> bool {
        LogLevel::parse(level).map_or(true, |level| level >= self.min_level)
    }

    /// Segment size at which the active file is rotated.
    pub fn rotate_bytes(&self) -> u64 {
        (self.budget_bytes / 4).max(1)
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), RecoveryError> {
        if !self.enabled(event.level) {
            return Ok(());
        }
        let dir = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir).map_err(|e| RecoveryError::Io(e.to_string()))?;

        let ts_ms = system_time_unix();
        rotate_if_larger(&self.path, self.rotate_bytes(), ts_ms)?;

        let mut line = serde_json::to_string(&LogLine {
            ts_ms,
            level: event.level,
            event_type: event.event_type,
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
        })
        .map_err(|e| RecoveryError::Io(e.to_string()))?;
        line.push('\n');

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(|e| RecoveryError::Io(e.to_string()))?;

        enforce_total_budget(dir, &self.path, self.budget_bytes)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct LogLine<'a> {
    ts_ms: i64,
    level: &'a str,
    event_type: &'a str,
    payload: Value,
}

/// Installs the process-wide run log. Later calls replace the previous sink.
pub fn init_run_log(logger: JsonlLogger) {
    let sink = RUN_LOG.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = sink.lock() {
        *guard = Some(logger);
    }
}

/// Appends one event to the run log. Events are dropped when no sink is installed.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Some(sink) = RUN_LOG.get() else {
        return;
    };
    let Ok(guard) = sink.lock() else {
        return;
    };
    if let Some(logger) = guard.as_ref() {
        let _ = logger.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

pub fn structured_fallback_line(component: &str, state: &str, message: &str) -> String {
    format!(
        "component={component} state={state} message={} ",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
