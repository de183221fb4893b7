use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::errors::RecoveryError;
use crate::logging::append_run_log;
use crate::runtime::{CallJournal, FileSystem};
use crate::types::CrashReport;

pub const REPORT_EXTENSION: &str = "json";

/// Crash reports captured by the crash-reporting subsystem and not yet sent.
pub trait CrashSource: Send + Sync {
    fn list_unsent_reports(&self) -> Result<Vec<CrashReport>, RecoveryError>;
    /// Removes a consumed report. Deleting a missing report succeeds.
    fn delete_report(&self, native_id: &str) -> Result<(), RecoveryError>;
}

/// On-disk layout of one crash report file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrashReportFile {
    pub id: Uuid,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub report: serde_json::Value,
}

fn default_provider() -> String {
    "unknown".to_string()
}

impl CrashReportFile {
    pub fn into_report(self, native_id: String) -> CrashReport {
        CrashReport {
            id: self.id,
            native_id,
            session_id: self.session_id.filter(|id| !id.trim().is_empty()),
            timestamp: self.timestamp,
            provider: self.provider,
            report: self.report,
        }
    }
}

/// Reads crash reports stored as `<native_id>.json` files in one directory.
pub struct DirectoryCrashSource {
    dir: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl DirectoryCrashSource {
    pub fn new(dir: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            dir: dir.into(),
            fs,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn report_path(&self, native_id: &str) -> PathBuf {
        self.dir.join(format!("{native_id}.{REPORT_EXTENSION}"))
    }

    /// Number of report files on disk, readable or not.
    pub fn pending_count(&self) -> Result<usize, RecoveryError> {
        if !self.dir_exists() {
            return Ok(0);
        }
        Ok(self
            .fs
            .list_files(&self.dir)?
            .iter()
            .filter(|path| is_report_file(path))
            .count())
    }

    fn dir_exists(&self) -> bool {
        self.fs.exists(&self.dir)
    }

    fn read_report(&self, path: &Path) -> Result<CrashReport, RecoveryError> {
        let native_id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .ok_or_else(|| RecoveryError::Fetch(format!("unnamed report {}", path.display())))?;
        let text = self
            .fs
            .read_to_string(path)
            .map_err(|e| RecoveryError::Fetch(format!("{}: {e}", path.display())))?;
        let file: CrashReportFile = serde_json::from_str(&text)
            .map_err(|e| RecoveryError::Fetch(format!("{}: {e}", path.display())))?;
        Ok(file.into_report(native_id))
    }
}

impl CrashSource for DirectoryCrashSource {
    fn list_unsent_reports(&self) -> Result<Vec<CrashReport>, RecoveryError> {
        if !self.dir_exists() {
            append_run_log(
                "debug",
                "crash_source.directory.missing",
                json!({ "dir": self.dir.display().to_string() }),
            );
            return Ok(Vec::new());
        }
        let files = self
            .fs
            .list_files(&self.dir)
            .map_err(|e| RecoveryError::Fetch(e.to_string()))?;

        let mut reports = Vec::new();
        for path in files.iter().filter(|path| is_report_file(path)) {
            match self.read_report(path) {
                Ok(report) => reports.push(report),
                // Left on disk: the crash reporter may still be writing it.
                Err(e) => append_run_log(
                    "warn",
                    "crash_source.report.unreadable",
                    json!({ "path": path.display().to_string(), "error": e.to_string() }),
                ),
            }
        }
        append_run_log(
            "debug",
            "crash_source.reports.listed",
            json!({ "dir": self.dir.display().to_string(), "count": reports.len() }),
        );
        Ok(reports)
    }

    fn delete_report(&self, native_id: &str) -> Result<(), RecoveryError> {
        if native_id.is_empty() || native_id.contains(['/', '\\']) || native_id.contains("..") {
            return Err(RecoveryError::Delete(format!(
                "invalid native report id {native_id:?}"
            )));
        }
        let path = self.report_path(native_id);
        if !self.fs.exists(&path) {
            return Ok(());
        }
        self.fs
            .remove_file(&path)
            .map_err(|e| RecoveryError::Delete(format!("{}: {e}", path.display())))
    }
}

fn is_report_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(REPORT_EXTENSION)
}

/// In-memory [`CrashSource`]. Calls are journaled as `crash.list` and
/// `crash.delete:<native_id>`.
#[derive(Default, Clone)]
pub struct FakeCrashSource {
    reports: Arc<Mutex<Vec<CrashReport>>>,
    list_failure: Arc<Mutex<Option<RecoveryError>>>,
    delete_failures: Arc<Mutex<HashMap<String, RecoveryError>>>,
    journal: CallJournal,
}

impl FakeCrashSource {
    pub fn with_journal(journal: CallJournal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn push(&self, report: CrashReport) {
        self.reports.lock().expect("reports lock").push(report);
    }

    pub fn reports(&self) -> Vec<CrashReport> {
        self.reports.lock().expect("reports lock").clone()
    }

    pub fn contains(&self, native_id: &str) -> bool {
        self.reports
            .lock()
            .expect("reports lock")
            .iter()
            .any(|report| report.native_id == native_id)
    }

    pub fn fail_list(&self, error: RecoveryError) {
        *self.list_failure.lock().expect("list failure lock") = Some(error);
    }

    pub fn fail_delete(&self, native_id: &str, error: RecoveryError) {
        self.delete_failures
            .lock()
            .expect("delete failures lock")
            .insert(native_id.to_string(), error);
    }

    pub fn journal(&self) -> &CallJournal {
        &self.journal
    }
}

impl CrashSource for FakeCrashSource {
    fn list_unsent_reports(&self) -> Result<Vec<CrashReport>, RecoveryError> {
        self.journal.record("crash.list");
        if let Some(err) = self.list_failure.lock().expect("list failure lock").clone() {
            return Err(err);
        }
        Ok(self.reports())
    }

    fn delete_report(&self, native_id: &str) -> Result<(), RecoveryError> {
        self.journal.record(format!("crash.delete:{native_id}"));
        if let Some(err) = self
            .delete_failures
            .lock()
            .expect("delete failures lock")
            .get(native_id)
        {
            return Err(err.clone());
        }
        self.reports
            .lock()
            .expect("reports lock")
            .retain(|report| report.native_id != native_id);
        Ok(())
    }
}
