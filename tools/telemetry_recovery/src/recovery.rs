use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crash_source::CrashSource;
use crate::delivery_monitor::DeliveryMonitor;
use crate::errors::RecoveryError;
use crate::logging::append_run_log;
use crate::payload::PayloadBuilder;
use crate::session_store::SessionStore;
use crate::types::{CrashReport, RecordKind, SessionRecord};
use crate::upload::{UploadGateway, UploadTicket};

/// Order in which unsent crash reports are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashReportOrder {
    /// Whatever order the crash source listed them in.
    Source,
    /// Oldest crash first; reports without a timestamp go last.
    #[default]
    Chronological,
}

impl CrashReportOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Chronological => "chronological",
        }
    }

    pub fn apply(self, reports: &mut [CrashReport]) {
        if self == Self::Chronological {
            reports.sort_by_key(|report| (report.timestamp.is_none(), report.timestamp));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingStorage,
    MissingUpload,
    AlreadyRunning,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingStorage => "missing_storage",
            Self::MissingUpload => "missing_upload",
            Self::AlreadyRunning => "already_running",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub kind: RecordKind,
    /// Record id, or `*` when a whole listing failed.
    pub record_id: String,
    pub error: RecoveryError,
}

/// What one recovery pass did. Report entries use the report UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub skipped: Option<SkipReason>,
    pub correlated_sessions: Vec<String>,
    pub uploaded_reports: Vec<String>,
    pub deleted_reports: Vec<String>,
    pub uploaded_sessions: Vec<String>,
    pub deleted_sessions: Vec<String>,
    pub failures: Vec<RecordFailure>,
}

impl RecoverySummary {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// True when the pass ran and found nothing to send.
    pub fn is_quiescent(&self) -> bool {
        self.skipped.is_none()
            && self.uploaded_reports.is_empty()
            && self.uploaded_sessions.is_empty()
            && self.failures.is_empty()
    }

    pub fn summary_line(&self) -> String {
        if let Some(reason) = self.skipped {
            return format!("recovery skipped: {}", reason.as_str());
        }
        format!(
            "recovery complete: reports uploaded={} deleted={} sessions correlated={} uploaded={} deleted={} failures={}",
            self.uploaded_reports.len(),
            self.deleted_reports.len(),
            self.correlated_sessions.len(),
            self.uploaded_sessions.len(),
            self.deleted_sessions.len(),
            self.failures.len()
        )
    }

    fn fail(&mut self, kind: RecordKind, record_id: &str, error: RecoveryError) {
        append_run_log(
            "warn",
            "recovery.record.failed",
            json!({
                "kind": kind.as_str(),
                "record_id": record_id,
                "error": error.to_string(),
            }),
        );
        self.failures.push(RecordFailure {
            kind,
            record_id: record_id.to_string(),
            error,
        });
    }
}

#[derive(Clone, Copy)]
enum Stage {
    Fetch,
    Update,
    UploadAccept,
    Delete,
}

/// Tags a collaborator error with the pipeline stage it happened in.
fn at_stage(stage: Stage, error: RecoveryError) -> RecoveryError {
    match (stage, error) {
        (Stage::Fetch, e @ RecoveryError::Fetch(_))
        | (Stage::Update, e @ RecoveryError::Update(_))
        | (Stage::UploadAccept, e @ RecoveryError::UploadAccept(_))
        | (Stage::Delete, e @ RecoveryError::Delete(_)) => e,
        (Stage::Fetch, e) => RecoveryError::Fetch(e.to_string()),
        (Stage::Update, e) => RecoveryError::Update(e.to_string()),
        (Stage::UploadAccept, e) => RecoveryError::UploadAccept(e.to_string()),
        (Stage::Delete, e) => RecoveryError::Delete(e.to_string()),
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives one recovery pass over unsent crash reports and finished sessions.
///
/// Every record moves through fetch, optional crash correlation, encode,
/// upload enqueue and local delete. The local copy is deleted as soon as the
/// gateway takes custody; delivery is only observed. A failure affects the
/// record it happened on and nothing else.
pub struct RecoveryCoordinator {
    builder: PayloadBuilder,
    order: CrashReportOrder,
    monitor: Option<Arc<DeliveryMonitor>>,
    in_flight: AtomicBool,
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        Self::new(PayloadBuilder::default(), CrashReportOrder::default())
    }
}

impl RecoveryCoordinator {
    pub fn new(builder: PayloadBuilder, order: CrashReportOrder) -> Self {
        Self {
            builder,
            order,
            monitor: None,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<DeliveryMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn order(&self) -> CrashReportOrder {
        self.order
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn recover_unsent_data(
        &self,
        storage: Option<&dyn SessionStore>,
        upload: Option<&dyn UploadGateway>,
        crash_source: Option<&dyn CrashSource>,
    ) -> RecoverySummary {
        let Some(storage) = storage else {
            return self.skip(SkipReason::MissingStorage);
        };
        let Some(upload) = upload else {
            return self.skip(SkipReason::MissingUpload);
        };
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.skip(SkipReason::AlreadyRunning);
        }
        let _guard = InFlight(&self.in_flight);

        append_run_log(
            "info",
            "recovery.pass.started",
            json!({
                "crash_source": crash_source.is_some(),
                "order": self.order.as_str(),
            }),
        );

        let mut summary = RecoverySummary::default();
        if let Some(crash_source) = crash_source {
            self.recover_crash_reports(storage, upload, crash_source, &mut summary);
        }
        self.recover_sessions(storage, upload, &mut summary);

        append_run_log(
            if summary.is_clean() { "info" } else { "warn" },
            "recovery.pass.completed",
            json!({
                "correlated_sessions": summary.correlated_sessions,
                "uploaded_reports": summary.uploaded_reports.len(),
                "deleted_reports": summary.deleted_reports.len(),
                "uploaded_sessions": summary.uploaded_sessions.len(),
                "deleted_sessions": summary.deleted_sessions.len(),
                "failures": summary.failures.len(),
            }),
        );
        summary
    }

    /// Records a pass that could not run and returns its summary.
    pub fn skip(&self, reason: SkipReason) -> RecoverySummary {
        append_run_log(
            "info",
            "recovery.pass.skipped",
            json!({ "reason": reason.as_str() }),
        );
        RecoverySummary::skipped(reason)
    }

    fn recover_crash_reports(
        &self,
        storage: &dyn SessionStore,
        upload: &dyn UploadGateway,
        crash_source: &dyn CrashSource,
        summary: &mut RecoverySummary,
    ) {
        let mut reports = match crash_source.list_unsent_reports() {
            Ok(reports) => reports,
            Err(e) => {
                summary.fail(RecordKind::CrashReport, "*", at_stage(Stage::Fetch, e));
                return;
            }
        };
        self.order.apply(&mut reports);

        for report in &reports {
            if let Some(session_id) = &report.session_id {
                correlate(storage, report, session_id, summary);
            }
            self.send_report(upload, crash_source, report, summary);
        }
    }

    fn send_report(
        &self,
        upload: &dyn UploadGateway,
        crash_source: &dyn CrashSource,
        report: &CrashReport,
        summary: &mut RecoverySummary,
    ) {
        let report_id = report.id.to_string();
        let payload = match self.builder.build_crash_report(report) {
            Ok(payload) => payload,
            Err(e) => return summary.fail(RecordKind::CrashReport, &report_id, e),
        };
        let bytes = payload.len();
        match upload.upload_blob(&report_id, payload) {
            Ok(ticket) => self.observe(ticket),
            Err(e) => {
                return summary.fail(
                    RecordKind::CrashReport,
                    &report_id,
                    at_stage(Stage::UploadAccept, e),
                )
            }
        }
        append_run_log(
            "info",
            "recovery.report.enqueued",
            json!({ "report_id": report_id, "native_id": report.native_id, "bytes": bytes }),
        );
        summary.uploaded_reports.push(report_id.clone());

        match crash_source.delete_report(&report.native_id) {
            Ok(()) => summary.deleted_reports.push(report_id),
            Err(e) => summary.fail(
                RecordKind::CrashReport,
                &report_id,
                at_stage(Stage::Delete, e),
            ),
        }
    }

    fn recover_sessions(
        &self,
        storage: &dyn SessionStore,
        upload: &dyn UploadGateway,
        summary: &mut RecoverySummary,
    ) {
        let sessions = match storage.fetch_finished_sessions() {
            Ok(sessions) => sessions,
            Err(e) => return summary.fail(RecordKind::Session, "*", at_stage(Stage::Fetch, e)),
        };
        for session in &sessions {
            self.send_session(storage, upload, session, summary);
        }
    }

    fn send_session(
        &self,
        storage: &dyn SessionStore,
        upload: &dyn UploadGateway,
        session: &SessionRecord,
        summary: &mut RecoverySummary,
    ) {
        let payload = match self.builder.build_session(session) {
            Ok(payload) => payload,
            Err(e) => return summary.fail(RecordKind::Session, &session.id, e),
        };
        let bytes = payload.len();
        match upload.upload_session(&session.id, payload) {
            Ok(ticket) => self.observe(ticket),
            Err(e) => {
                return summary.fail(
                    RecordKind::Session,
                    &session.id,
                    at_stage(Stage::UploadAccept, e),
                )
            }
        }
        append_run_log(
            "info",
            "recovery.session.enqueued",
            json!({ "session_id": session.id, "bytes": bytes }),
        );
        summary.uploaded_sessions.push(session.id.clone());

        match storage.delete_session(session) {
            Ok(()) => summary.deleted_sessions.push(session.id.clone()),
            Err(e) => summary.fail(RecordKind::Session, &session.id, at_stage(Stage::Delete, e)),
        }
    }

    fn observe(&self, ticket: UploadTicket) {
        // Without a monitor the ticket is dropped and the gateway's report goes nowhere.
        if let Some(monitor) = &self.monitor {
            monitor.watch(ticket);
        }
    }
}

/// Marks the owning session as crashed and persists it before the report or
/// the session is uploaded.
fn correlate(
    storage: &dyn SessionStore,
    report: &CrashReport,
    session_id: &str,
    summary: &mut RecoverySummary,
) {
    let mut session = match storage.fetch_session(session_id) {
        Ok(Some(session)) => session,
        Ok(None) => {
            append_run_log(
                "debug",
                "recovery.session.not_found",
                json!({ "session_id": session_id, "report_id": report.id.to_string() }),
            );
            return;
        }
        Err(e) => return summary.fail(RecordKind::Session, session_id, at_stage(Stage::Fetch, e)),
    };
    let previous_end = session.end_time;
    session.apply_crash(report);
    match storage.update_session(&session) {
        Ok(()) => {
            append_run_log(
                "info",
                "recovery.session.correlated",
                json!({
                    "session_id": session_id,
                    "report_id": report.id.to_string(),
                    "previous_end_time": previous_end,
                    "end_time": session.end_time,
                }),
            );
            summary.correlated_sessions.push(session_id.to_string());
        }
        Err(e) => summary.fail(RecordKind::Session, session_id, at_stage(Stage::Update, e)),
    }
}
