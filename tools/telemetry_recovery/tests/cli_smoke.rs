use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::json;
use std::path::Path;
use telemetry_recovery::payload::decode_payload;
use telemetry_recovery::session_store::SqliteSessionStore;
use telemetry_recovery::types::SessionRecord;
use uuid::Uuid;

fn stdout_of(out: &assert_cmd::assert::Assert) -> String {
    String::from_utf8(out.get_output().stdout.clone()).expect("utf8")
}

fn seed_sessions(data_dir: &Path) {
    let store = SqliteSessionStore::open(data_dir.join("sessions.sqlite")).expect("open store");
    let mut s1 = SessionRecord::new("s1", 1_000);
    s1.end_time = Some(2_000);
    let mut s2 = SessionRecord::new("s2", 3_000);
    s2.end_time = Some(4_000);
    store.insert_session(&s1).expect("s1");
    store.insert_session(&s2).expect("s2");
    store.insert_session(&SessionRecord::new("live", 5_000)).expect("live");
}

fn seed_crash(data_dir: &Path, native_id: &str, session_id: &str, timestamp: i64) -> Uuid {
    let id = Uuid::new_v4();
    let dir = data_dir.join("crash_reports");
    std::fs::create_dir_all(&dir).expect("crash dir");
    let body = json!({
        "id": id,
        "session_id": session_id,
        "timestamp": timestamp,
        "provider": "kscrash",
        "report": {"signal": "SIGABRT"},
    });
    std::fs::write(dir.join(format!("{native_id}.json")), body.to_string()).expect("write crash");
    id
}

#[test]
fn help_lists_recovery_flags() {
    let mut cmd = cargo_bin_cmd!("telemetry-recovery");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = stdout_of(&out);

    assert!(stdout.contains("--data-dir"));
    assert!(stdout.contains("--order"));
    assert!(stdout.contains("--no-crash-reports"));
    assert!(stdout.contains("--status"));
}

#[test]
fn empty_data_dir_recovers_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("telemetry-recovery");
    cmd.arg("--data-dir").arg(temp.path());
    let out = cmd.assert().success();
    let stdout = stdout_of(&out);

    assert!(stdout.contains("reports uploaded=0"), "{stdout}");
    assert!(stdout.contains("failures=0"), "{stdout}");
    assert!(temp.path().join("outbox/blobs").is_dir());
    assert!(temp.path().join("outbox/sessions").is_dir());
}

#[test]
fn pass_moves_sessions_and_crashes_into_the_outbox() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed_sessions(temp.path());
    let report_id = seed_crash(temp.path(), "0001", "s1", 2_500);

    let mut cmd = cargo_bin_cmd!("telemetry-recovery");
    cmd.arg("--data-dir").arg(temp.path());
    let out = cmd.assert().success();
    let stdout = stdout_of(&out);
    assert!(
        stdout.contains("reports uploaded=1 deleted=1 sessions correlated=1 uploaded=2 deleted=2 failures=0"),
        "{stdout}"
    );

    assert!(!temp.path().join("crash_reports/0001.json").exists());
    let blob = temp
        .path()
        .join(format!("outbox/blobs/{report_id}.json.gz"));
    assert!(blob.is_file());
    assert!(temp
        .path()
        .join(format!("outbox/blobs/{report_id}.sha256"))
        .is_file());

    let s1 = std::fs::read(temp.path().join("outbox/sessions/s1.json.gz")).expect("s1 payload");
    let body = decode_payload(&s1).expect("decode");
    assert_eq!(body["end_time"], json!(2_500));
    assert_eq!(body["crash_report_id"], json!(report_id.to_string()));
    assert!(temp.path().join("outbox/sessions/s2.json.gz").is_file());
    assert!(!temp.path().join("outbox/sessions/live.json.gz").exists());

    let store = SqliteSessionStore::open(temp.path().join("sessions.sqlite")).expect("reopen");
    assert_eq!(store.count_sessions().expect("count"), (1, 0));

    let log = std::fs::read_to_string(temp.path().join("logs/recovery.jsonl")).expect("run log");
    assert!(log.contains("\"event_type\":\"recovery.pass.completed\""));
    assert!(log.contains("\"event_type\":\"upload.delivered\""));
}

#[test]
fn status_reports_pending_counts_without_recovering() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed_sessions(temp.path());
    seed_crash(temp.path(), "0001", "s1", 2_500);

    let mut cmd = cargo_bin_cmd!("telemetry-recovery");
    cmd.arg("--status").arg("--data-dir").arg(temp.path());
    let out = cmd.assert().success();
    let stdout = stdout_of(&out);

    assert!(stdout.contains("sessions=3 finished=2"), "{stdout}");
    assert!(stdout.contains("crash_reports=1"), "{stdout}");
    assert!(stdout.contains("outbox_blobs=0 outbox_sessions=0"), "{stdout}");
    assert!(temp.path().join("crash_reports/0001.json").exists());
}

#[test]
fn no_crash_reports_flag_leaves_crash_files_alone() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed_sessions(temp.path());
    seed_crash(temp.path(), "0001", "s1", 2_500);

    let mut cmd = cargo_bin_cmd!("telemetry-recovery");
    cmd.arg("--no-crash-reports").arg("--data-dir").arg(temp.path());
    let out = cmd.assert().success();
    let stdout = stdout_of(&out);

    assert!(stdout.contains("sessions correlated=0 uploaded=2"), "{stdout}");
    assert!(temp.path().join("crash_reports/0001.json").exists());
}

#[test]
fn disabled_upload_skips_the_pass() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed_sessions(temp.path());
    let config = temp.path().join("recovery.toml");
    std::fs::write(&config, "[upload]\nenabled = false\n").expect("config");

    let mut cmd = cargo_bin_cmd!("telemetry-recovery");
    cmd.arg("--config")
        .arg(&config)
        .arg("--data-dir")
        .arg(temp.path());
    let out = cmd.assert().success();
    let stdout = stdout_of(&out);

    assert!(stdout.contains("recovery skipped: missing_upload"), "{stdout}");
    assert!(!temp.path().join("outbox").exists());
}

#[test]
fn invalid_config_path_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cmd = cargo_bin_cmd!("telemetry-recovery");
    cmd.arg("--config")
        .arg(temp.path().join("missing.toml"))
        .arg("--data-dir")
        .arg(temp.path());
    cmd.assert().failure();
}

#[test]
fn out_of_range_config_exits_nonzero() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = temp.path().join("recovery.toml");
    std::fs::write(&config, "[payload]\ncompression_level = 11\n").expect("config");

    let mut cmd = cargo_bin_cmd!("telemetry-recovery");
    cmd.arg("--config").arg(&config);
    let out = cmd.assert().failure();
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("compression_level"), "{stderr}");
}

#[test]
fn unknown_order_is_rejected() {
    let mut cmd = cargo_bin_cmd!("telemetry-recovery");
    cmd.arg("--order").arg("newest");
    cmd.assert().failure();
}
