pub mod config;
pub mod crash_source;
pub mod delivery_monitor;
pub mod errors;
pub mod log_retention;
pub mod logging;
pub mod payload;
pub mod recovery;
pub mod runtime;
pub mod session_store;
pub mod types;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use clap::{error::ErrorKind, Parser, ValueEnum};
use config::{load_config, AppConfig, CliOverrides, RuntimePaths};
use crash_source::{CrashSource, DirectoryCrashSource};
use delivery_monitor::DeliveryMonitor;
use errors::RecoveryError;
use logging::{append_run_log, init_run_log, structured_fallback_line, JsonlLogger, LogLevel};
use payload::PayloadBuilder;
use recovery::{CrashReportOrder, RecoveryCoordinator, SkipReason};
use runtime::ProductionRuntime;
use serde_json::json;
use session_store::{SessionStore, SqliteSessionStore};
use types::RecordKind;
use upload::{OutboxGateway, UploadGateway};

#[derive(Debug, Clone, Parser)]
#[command(name = "telemetry-recovery")]
#[command(about = "Hand unsent telemetry sessions and crash reports to the upload outbox")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    #[arg(long)]
    pub data_dir: Option<std::path::PathBuf>,
    #[arg(long, value_enum)]
    pub order: Option<CliOrder>,
    #[arg(long, default_value_t = false)]
    pub no_crash_reports: bool,
    #[arg(long, default_value_t = false)]
    pub status: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliOrder {
    Source,
    Chronological,
}

impl From<CliOrder> for CrashReportOrder {
    fn from(value: CliOrder) -> Self {
        match value {
            CliOrder::Source => CrashReportOrder::Source,
            CliOrder::Chronological => CrashReportOrder::Chronological,
        }
    }
}

/// Collaborators opened for one run; `None` where config disables them.
struct Collaborators {
    storage: Option<SqliteSessionStore>,
    crash_source: Option<DirectoryCrashSource>,
    upload: Option<OutboxGateway>,
}

pub fn run() -> Result<i32, RecoveryError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| RecoveryError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    runtime: &ProductionRuntime,
) -> Result<i32, RecoveryError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(RecoveryError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        data_dir: cli.data_dir.clone(),
        order: cli.order.map(Into::into),
        no_crash_reports: cli.no_crash_reports,
    };
    let (cfg, paths) = load_config(&overrides, cwd, runtime.file_system.as_ref())?;

    init_run_log(JsonlLogger {
        path: paths.log_path.clone(),
        max_payload_bytes: cfg.logging.max_payload_bytes,
        budget_bytes: cfg.logging.budget_bytes,
        min_level: LogLevel::parse(&cfg.logging.level).unwrap_or(LogLevel::Info),
    });
    append_run_log(
        "info",
        "run.started",
        json!({
            "data_dir": paths.data_dir.display().to_string(),
            "status_only": cli.status,
            "storage": cfg.storage.enabled,
            "crash_reports": cfg.crash_reports.enabled,
            "upload": cfg.upload.enabled,
            "order": cfg.crash_reports.order.as_str(),
        }),
    );

    let coordinator = RecoveryCoordinator::new(
        PayloadBuilder::new(cfg.payload.compression_level, cfg.payload.max_payload_bytes),
        cfg.crash_reports.order,
    );
    // A pass that cannot run must not create the database or the outbox.
    if !cli.status {
        if let Some(reason) = disabled_pass(&cfg) {
            let summary = coordinator.skip(reason);
            emit(runtime, "skipped", &summary.summary_line())?;
            return Ok(0);
        }
    }

    let collaborators = open_collaborators(&cfg, &paths, runtime)?;

    if cli.status {
        let line = status_line(&collaborators)?;
        emit(runtime, "status", &line)?;
        return Ok(0);
    }

    let monitor = Arc::new(DeliveryMonitor::spawn()?);
    let coordinator = coordinator.with_monitor(Arc::clone(&monitor));

    let summary = coordinator.recover_unsent_data(
        collaborators
            .storage
            .as_ref()
            .map(|store| store as &dyn SessionStore),
        collaborators
            .upload
            .as_ref()
            .map(|gateway| gateway as &dyn UploadGateway),
        collaborators
            .crash_source
            .as_ref()
            .map(|source| source as &dyn CrashSource),
    );

    let settled = monitor.close_and_wait(Duration::from_millis(cfg.upload.settle_timeout_ms));
    append_run_log(
        "info",
        "run.completed",
        json!({
            "summary": summary.summary_line(),
            "deliveries_settled": settled,
        }),
    );

    let state = if summary.skipped.is_some() {
        "skipped"
    } else if summary.is_clean() {
        "complete"
    } else {
        "partial"
    };
    emit(runtime, state, &summary.summary_line())?;
    for failure in &summary.failures {
        emit(
            runtime,
            "failure",
            &format!(
                "{} {}: {}",
                failure.kind.as_str(),
                failure.record_id,
                failure.error
            ),
        )?;
    }
    Ok(0)
}

fn disabled_pass(cfg: &AppConfig) -> Option<SkipReason> {
    if !cfg.storage.enabled {
        Some(SkipReason::MissingStorage)
    } else if !cfg.upload.enabled {
        Some(SkipReason::MissingUpload)
    } else {
        None
    }
}

fn open_collaborators(
    cfg: &AppConfig,
    paths: &RuntimePaths,
    runtime: &ProductionRuntime,
) -> Result<Collaborators, RecoveryError> {
    let storage = if cfg.storage.enabled {
        Some(SqliteSessionStore::open(&paths.session_db)?)
    } else {
        None
    };
    let crash_source = cfg.crash_reports.enabled.then(|| {
        DirectoryCrashSource::new(paths.crash_dir.clone(), Arc::clone(&runtime.file_system))
    });
    let upload = if cfg.upload.enabled {
        Some(OutboxGateway::open(
            paths.outbox_dir.clone(),
            Arc::clone(&runtime.file_system),
        )?)
    } else {
        None
    };
    Ok(Collaborators {
        storage,
        crash_source,
        upload,
    })
}

fn status_line(collaborators: &Collaborators) -> Result<String, RecoveryError> {
    let mut parts = Vec::new();
    if let Some(store) = &collaborators.storage {
        let (total, finished) = store.count_sessions()?;
        parts.push(format!("sessions={total} finished={finished}"));
    }
    if let Some(source) = &collaborators.crash_source {
        parts.push(format!("crash_reports={}", source.pending_count()?));
    }
    if let Some(outbox) = &collaborators.upload {
        parts.push(format!(
            "outbox_blobs={} outbox_sessions={}",
            outbox.pending_ids(RecordKind::CrashReport)?.len(),
            outbox.pending_ids(RecordKind::Session)?.len()
        ));
    }
    if parts.is_empty() {
        parts.push("nothing enabled".to_string());
    }
    Ok(format!("status: {}", parts.join(" ")))
}

fn emit(runtime: &ProductionRuntime, state: &str, line: &str) -> Result<(), RecoveryError> {
    if runtime.terminal.stdin_is_tty() {
        runtime.terminal.write_line(line)
    } else {
        runtime
            .terminal
            .write_line(&structured_fallback_line("telemetry-recovery", state, line))
    }
}
