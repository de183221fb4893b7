use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::json;
use telemetry_recovery::crash_source::{CrashSource, FakeCrashSource};
use telemetry_recovery::delivery_monitor::DeliveryMonitor;
use telemetry_recovery::errors::RecoveryError;
use telemetry_recovery::payload::{decode_payload, PayloadBuilder};
use telemetry_recovery::recovery::{
    CrashReportOrder, RecoveryCoordinator, RecoverySummary, SkipReason,
};
use telemetry_recovery::runtime::CallJournal;
use telemetry_recovery::session_store::{
    MemorySessionStore, SessionStore, SqliteSessionStore, StoreOp,
};
use telemetry_recovery::types::{CrashReport, RecordKind, SessionRecord};
use telemetry_recovery::upload::{AckMode, DeliveryStatus, FakeUploadGateway, UploadGateway};
use uuid::Uuid;

struct Harness {
    journal: CallJournal,
    store: MemorySessionStore,
    crashes: FakeCrashSource,
    gateway: FakeUploadGateway,
}

impl Harness {
    fn new(mode: AckMode) -> Self {
        let journal = CallJournal::default();
        Self {
            store: MemorySessionStore::with_journal(journal.clone()),
            crashes: FakeCrashSource::with_journal(journal.clone()),
            gateway: FakeUploadGateway::with_journal(mode, journal.clone()),
            journal,
        }
    }

    fn run(&self, coordinator: &RecoveryCoordinator) -> RecoverySummary {
        coordinator.recover_unsent_data(
            Some(&self.store),
            Some(&self.gateway),
            Some(&self.crashes),
        )
    }

    fn position(&self, entry: &str) -> usize {
        self.journal
            .position(entry)
            .unwrap_or_else(|| panic!("missing journal entry {entry}: {:?}", self.journal.entries()))
    }
}

fn finished(id: &str, start: i64, end: i64) -> SessionRecord {
    let mut session = SessionRecord::new(id, start);
    session.end_time = Some(end);
    session.process_id = "proc-7".to_string();
    session
}

fn crash(native_id: &str, session_id: Option<&str>, timestamp: Option<i64>) -> CrashReport {
    CrashReport {
        id: Uuid::new_v4(),
        native_id: native_id.to_string(),
        session_id: session_id.map(str::to_string),
        timestamp,
        provider: "kscrash".to_string(),
        report: json!({"signal": "SIGSEGV", "frames": ["main", "render"]}),
    }
}

#[test]
fn end_to_end_pass_correlates_uploads_and_empties_both_stores() {
    let h = Harness::new(AckMode::Immediate);
    h.store.insert(finished("s1", 1_000, 2_000));
    h.store.insert(finished("s2", 3_000, 4_000));
    let report = crash("native-1", Some("s1"), Some(2_500));
    let report_id = report.id.to_string();
    h.crashes.push(report);

    let summary = h.run(&RecoveryCoordinator::default());

    assert!(summary.is_clean(), "{:?}", summary.failures);
    assert_eq!(summary.correlated_sessions, vec!["s1".to_string()]);
    assert_eq!(summary.uploaded_reports, vec![report_id.clone()]);
    assert_eq!(summary.deleted_reports, vec![report_id.clone()]);
    assert_eq!(summary.uploaded_sessions, vec!["s1".to_string(), "s2".to_string()]);
    assert_eq!(summary.deleted_sessions, vec!["s1".to_string(), "s2".to_string()]);
    assert!(h.store.is_empty());
    assert!(h.crashes.reports().is_empty());

    for entry in [
        format!("upload.blob:{report_id}"),
        "upload.session:s1".to_string(),
        "upload.session:s2".to_string(),
        "crash.delete:native-1".to_string(),
        "store.delete:s1".to_string(),
        "store.delete:s2".to_string(),
    ] {
        assert_eq!(h.journal.count(&entry), 1, "{entry}");
    }

    let uploads = h.gateway.uploads();
    let s1 = uploads
        .iter()
        .find(|upload| upload.kind == RecordKind::Session && upload.id == "s1")
        .expect("s1 uploaded");
    let body = decode_payload(&s1.data).expect("decode");
    assert_eq!(body["end_time"], json!(2_500));
    assert_eq!(body["crash_report_id"], json!(report_id));
}

#[test]
fn correlation_is_persisted_before_any_upload_of_that_session() {
    let h = Harness::new(AckMode::Immediate);
    h.store.insert(finished("s1", 10, 20));
    let report = crash("n1", Some("s1"), Some(30));
    let report_id = report.id.to_string();
    h.crashes.push(report);

    h.run(&RecoveryCoordinator::default());

    let update = h.position("store.update:s1");
    assert!(h.position("store.fetch:s1") < update);
    assert!(update < h.position(&format!("upload.blob:{report_id}")));
    assert!(update < h.position("crash.delete:n1"));
    assert!(update < h.position("upload.session:s1"));
}

#[test]
fn crash_timestamp_earlier_than_end_time_does_not_rewind_it() {
    let h = Harness::new(AckMode::Immediate);
    h.store.insert(finished("s1", 10, 50));
    let report = crash("n1", Some("s1"), Some(40));
    let report_id = report.id.to_string();
    h.crashes.push(report);
    h.store.insert({
        let mut open = SessionRecord::new("open", 5);
        open.end_time = None;
        open
    });
    h.crashes.push(crash("n2", Some("open"), None));

    h.gateway.reject("s1", RecoveryError::Io("keep for inspection".to_string()));
    h.gateway.reject("open", RecoveryError::Io("keep for inspection".to_string()));
    h.run(&RecoveryCoordinator::default());

    let s1 = h.store.get("s1").expect("s1 kept");
    assert_eq!(s1.end_time, Some(50));
    assert_eq!(s1.crash_report_id, Some(report_id));

    // No timestamp: linked to the crash but still unfinished, so never uploaded.
    let open = h.store.get("open").expect("open kept");
    assert_eq!(open.end_time, None);
    assert!(open.crash_report_id.is_some());
    assert_eq!(h.journal.count("upload.session:open"), 0);
}

#[test]
fn crash_on_open_session_finishes_it_in_the_same_pass() {
    let h = Harness::new(AckMode::Immediate);
    h.store.insert(SessionRecord::new("live", 100));
    h.crashes.push(crash("n1", Some("live"), Some(900)));

    let summary = h.run(&RecoveryCoordinator::default());

    assert_eq!(summary.uploaded_sessions, vec!["live".to_string()]);
    let upload = &h.gateway.uploads()[1];
    assert_eq!(upload.id, "live");
    assert_eq!(decode_payload(&upload.data).expect("decode")["end_time"], json!(900));
}

#[test]
fn encoding_failure_on_one_report_does_not_stop_the_next() {
    let h = Harness::new(AckMode::Immediate);
    let mut oversized = crash("big", None, Some(1));
    oversized.report = json!({ "blob": "x".repeat(4_096) });
    h.crashes.push(oversized);
    h.crashes.push(crash("small", None, Some(2)));
    h.store.insert(finished("s1", 1, 2));

    let coordinator =
        RecoveryCoordinator::new(PayloadBuilder::new(6, 2_048), CrashReportOrder::Source);
    let summary = h.run(&coordinator);

    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].kind, RecordKind::CrashReport);
    assert!(matches!(summary.failures[0].error, RecoveryError::Encoding(_)));
    assert!(h.crashes.contains("big"));
    assert!(!h.crashes.contains("small"));
    assert_eq!(h.journal.count("crash.delete:big"), 0);
    assert_eq!(summary.deleted_sessions, vec!["s1".to_string()]);
}

#[test]
fn fetch_failure_for_one_session_leaves_other_reports_untouched() {
    let h = Harness::new(AckMode::Immediate);
    h.store.insert(finished("s1", 1, 2));
    h.store.insert(finished("s2", 3, 4));
    h.store.fail_on(
        StoreOp::Fetch,
        "s1",
        RecoveryError::Database("disk I/O error".to_string()),
    );
    h.crashes.push(crash("n1", Some("s1"), Some(10)));
    h.crashes.push(crash("n2", Some("s2"), Some(20)));

    let summary = h.run(&RecoveryCoordinator::default());

    assert_eq!(summary.failures.len(), 1);
    assert!(matches!(summary.failures[0].error, RecoveryError::Fetch(_)));
    assert_eq!(summary.correlated_sessions, vec!["s2".to_string()]);
    assert_eq!(summary.deleted_reports.len(), 2);
    assert!(h.crashes.reports().is_empty());
}

#[test]
fn local_delete_happens_while_delivery_is_still_pending() {
    let h = Harness::new(AckMode::Hold);
    h.store.insert(finished("s1", 1, 2));
    h.crashes.push(crash("n1", None, Some(5)));
    let monitor = Arc::new(DeliveryMonitor::spawn().expect("monitor"));
    let coordinator = RecoveryCoordinator::default().with_monitor(Arc::clone(&monitor));

    let summary = h.run(&coordinator);

    assert_eq!(h.gateway.held_count(), 2);
    assert!(h.store.is_empty());
    assert!(h.crashes.reports().is_empty());
    assert_eq!(summary.deleted_sessions, vec!["s1".to_string()]);
    assert!(!monitor.close_and_wait(Duration::from_millis(50)));
    assert!(monitor.outcomes().is_empty());

    h.gateway.complete_all(Err(RecoveryError::Delivery("collector 503".to_string())));
    assert!(monitor.close_and_wait(Duration::from_secs(5)));
    let outcomes = monitor.outcomes();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .all(|outcome| matches!(outcome.status, DeliveryStatus::Failed(_))));
}

#[test]
fn missing_collaborators_make_the_pass_a_no_op() {
    let h = Harness::new(AckMode::Immediate);
    h.store.insert(finished("s1", 1, 2));
    h.crashes.push(crash("n1", Some("s1"), Some(3)));
    let coordinator = RecoveryCoordinator::default();

    let no_storage = coordinator.recover_unsent_data(None, Some(&h.gateway), Some(&h.crashes));
    assert_eq!(no_storage.skipped, Some(SkipReason::MissingStorage));

    let no_upload = coordinator.recover_unsent_data(Some(&h.store), None, Some(&h.crashes));
    assert_eq!(no_upload.skipped, Some(SkipReason::MissingUpload));

    assert!(h.journal.entries().is_empty());
    assert_eq!(h.store.len(), 1);
    assert!(h.crashes.contains("n1"));
}

#[test]
fn second_pass_on_a_quiescent_store_finds_nothing() {
    let h = Harness::new(AckMode::Immediate);
    h.store.insert(finished("s1", 1, 2));
    h.crashes.push(crash("n1", Some("s1"), Some(3)));
    let coordinator = RecoveryCoordinator::default();

    let first = h.run(&coordinator);
    assert_eq!(first.uploaded_sessions.len(), 1);
    let uploads_after_first = h.gateway.uploads().len();

    let second = h.run(&coordinator);
    assert!(second.is_quiescent());
    assert_eq!(h.gateway.uploads().len(), uploads_after_first);
}

#[test]
fn without_crash_source_only_sessions_are_recovered() {
    let h = Harness::new(AckMode::Immediate);
    h.store.insert(finished("s1", 1, 2));
    h.crashes.push(crash("n1", Some("s1"), Some(3)));

    let summary = RecoveryCoordinator::default().recover_unsent_data(
        Some(&h.store),
        Some(&h.gateway),
        None,
    );

    assert_eq!(summary.uploaded_sessions, vec!["s1".to_string()]);
    assert!(h.crashes.contains("n1"));
    assert_eq!(h.journal.count("crash.list"), 0);
}

#[test]
fn chronological_order_correlates_oldest_crash_first() {
    let h = Harness::new(AckMode::Immediate);
    h.store.insert(SessionRecord::new("s1", 1));
    let later = crash("later", Some("s1"), Some(200));
    let earlier = crash("earlier", Some("s1"), Some(100));
    let later_id = later.id.to_string();
    h.crashes.push(later);
    h.crashes.push(earlier);

    h.gateway.reject("s1", RecoveryError::Io("hold".to_string()));
    h.run(&RecoveryCoordinator::default());

    assert!(h.position("crash.delete:earlier") < h.position("crash.delete:later"));
    let s1 = h.store.get("s1").expect("kept");
    assert_eq!(s1.end_time, Some(200));
    assert_eq!(s1.crash_report_id, Some(later_id));
}

/// Store that re-enters the coordinator while a pass is running.
struct ReentrantStore {
    inner: MemorySessionStore,
    gateway: FakeUploadGateway,
    coordinator: OnceLock<Arc<RecoveryCoordinator>>,
    nested: Mutex<Option<RecoverySummary>>,
}

impl SessionStore for ReentrantStore {
    fn fetch_session(&self, id: &str) -> Result<Option<SessionRecord>, RecoveryError> {
        self.inner.fetch_session(id)
    }

    fn update_session(&self, session: &SessionRecord) -> Result<(), RecoveryError> {
        self.inner.update_session(session)
    }

    fn fetch_finished_sessions(&self) -> Result<Vec<SessionRecord>, RecoveryError> {
        if let Some(coordinator) = self.coordinator.get() {
            let nested = coordinator.recover_unsent_data(
                Some(&self.inner),
                Some(&self.gateway as &dyn UploadGateway),
                None,
            );
            *self.nested.lock().expect("nested lock") = Some(nested);
        }
        self.inner.fetch_finished_sessions()
    }

    fn delete_session(&self, session: &SessionRecord) -> Result<(), RecoveryError> {
        self.inner.delete_session(session)
    }
}

#[test]
fn concurrent_invocation_is_refused_by_the_single_flight_guard() {
    let gateway = FakeUploadGateway::new(AckMode::Immediate);
    let store = ReentrantStore {
        inner: MemorySessionStore::default(),
        gateway: gateway.clone(),
        coordinator: OnceLock::new(),
        nested: Mutex::new(None),
    };
    store.inner.insert(finished("s1", 1, 2));
    let coordinator = Arc::new(RecoveryCoordinator::default());
    let _ = store.coordinator.set(Arc::clone(&coordinator));

    let outer = coordinator.recover_unsent_data(Some(&store), Some(&gateway), None);

    let nested = store.nested.lock().expect("nested lock").clone().expect("nested ran");
    assert_eq!(nested.skipped, Some(SkipReason::AlreadyRunning));
    assert_eq!(outer.uploaded_sessions, vec!["s1".to_string()]);
    assert_eq!(gateway.uploads().len(), 1);
    assert!(!coordinator.is_running());
}

#[test]
fn sqlite_store_round_trips_a_full_recovery_pass() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteSessionStore::open(dir.path().join("sessions.sqlite")).expect("open");
    store.insert_session(&finished("s1", 1_000, 2_000)).expect("s1");
    store.insert_session(&SessionRecord::new("live", 3_000)).expect("live");
    let crashes = FakeCrashSource::default();
    let report = crash("n1", Some("s1"), Some(2_500));
    crashes.push(report.clone());
    let gateway = FakeUploadGateway::new(AckMode::Immediate);

    let summary = RecoveryCoordinator::default().recover_unsent_data(
        Some(&store),
        Some(&gateway),
        Some(&crashes as &dyn CrashSource),
    );

    assert!(summary.is_clean(), "{:?}", summary.failures);
    assert_eq!(store.count_sessions().expect("count"), (1, 0));
    let body = decode_payload(&gateway.uploads()[1].data).expect("decode");
    assert_eq!(body["id"], json!("s1"));
    assert_eq!(body["end_time"], json!(2_500));
    assert_eq!(body["crash_report_id"], json!(report.id.to_string()));
}

#[test]
fn undecodable_sqlite_rows_do_not_block_finished_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("sessions.sqlite");
    let store = SqliteSessionStore::open(&db_path).expect("open");
    store.insert_session(&finished("good1", 1_000, 2_000)).expect("good1");
    store.insert_session(&finished("good2", 3_000, 4_000)).expect("good2");

    let conn = rusqlite::Connection::open(&db_path).expect("raw connection");
    conn.execute(
        "INSERT INTO sessions (id, process_id, state, start_time, end_time, last_heartbeat_time) \
         VALUES ('bad-state', 'p', 'paused', 1, 5, 1)",
        [],
    )
    .expect("bad state row");
    conn.execute(
        "INSERT INTO sessions (id, process_id, state, start_time, end_time, last_heartbeat_time, properties) \
         VALUES ('bad-props', 'p', 'background', 2, 6, 2, '{not json')",
        [],
    )
    .expect("bad properties row");
    drop(conn);

    let gateway = FakeUploadGateway::new(AckMode::Immediate);
    let summary = RecoveryCoordinator::default().recover_unsent_data(
        Some(&store),
        Some(&gateway),
        None,
    );

    assert!(summary.is_clean(), "{:?}", summary.failures);
    assert_eq!(
        gateway.uploaded_ids(RecordKind::Session),
        vec!["good1".to_string(), "good2".to_string()]
    );
    assert_eq!(store.count_sessions().expect("count"), (2, 2));
    assert!(store.fetch_session("good1").expect("fetch").is_none());
}
