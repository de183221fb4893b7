use crate::errors::RecoveryError;
use crate::logging::{
    LogLevel, DEFAULT_DISK_BUDGET_BYTES, DEFAULT_MAX_PAYLOAD_BYTES as LOG_MAX_PAYLOAD_BYTES,
};
use crate::payload::{DEFAULT_COMPRESSION_LEVEL, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::recovery::CrashReportOrder;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub order: Option<CrashReportOrder>,
    pub no_crash_reports: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub crash_reports: CrashReportsConfig,
    pub upload: UploadConfig,
    pub payload: PayloadConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrashReportsConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub order: CrashReportOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadConfig {
    pub enabled: bool,
    pub outbox_dir: PathBuf,
    pub settle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayloadConfig {
    pub compression_level: u32,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: PathBuf,
    pub level: String,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                enabled: true,
                path: PathBuf::from("sessions.sqlite"),
            },
            crash_reports: CrashReportsConfig {
                enabled: true,
                directory: PathBuf::from("crash_reports"),
                order: CrashReportOrder::Chronological,
            },
            upload: UploadConfig {
                enabled: true,
                outbox_dir: PathBuf::from("outbox"),
                settle_timeout_ms: 2_000,
            },
            payload: PayloadConfig {
                compression_level: DEFAULT_COMPRESSION_LEVEL,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            },
            logging: LoggingConfig {
                path: PathBuf::from("logs/recovery.jsonl"),
                level: "info".to_string(),
                max_payload_bytes: LOG_MAX_PAYLOAD_BYTES,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

/// Absolute locations every collaborator works from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub data_dir: PathBuf,
    pub session_db: PathBuf,
    pub crash_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    storage: Option<PartialStorageConfig>,
    crash_reports: Option<PartialCrashReportsConfig>,
    upload: Option<PartialUploadConfig>,
    payload: Option<PartialPayloadConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStorageConfig {
    enabled: Option<bool>,
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialCrashReportsConfig {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
    order: Option<CrashReportOrder>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialUploadConfig {
    enabled: Option<bool>,
    outbox_dir: Option<PathBuf>,
    settle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPayloadConfig {
    compression_level: Option<u32>,
    max_payload_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    level: Option<String>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<(AppConfig, RuntimePaths), RecoveryError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(&absolutize_path(process_cwd, path))?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| RecoveryError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;

    let paths = resolve_paths(process_cwd, &cfg, overrides);
    Ok((cfg, paths))
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(storage) = partial.storage {
        if let Some(enabled) = storage.enabled {
            cfg.storage.enabled = enabled;
        }
        if let Some(path) = storage.path {
            cfg.storage.path = path;
        }
    }

    if let Some(crash_reports) = partial.crash_reports {
        if let Some(enabled) = crash_reports.enabled {
            cfg.crash_reports.enabled = enabled;
        }
        if let Some(directory) = crash_reports.directory {
            cfg.crash_reports.directory = directory;
        }
        if let Some(order) = crash_reports.order {
            cfg.crash_reports.order = order;
        }
    }

    if let Some(upload) = partial.upload {
        if let Some(enabled) = upload.enabled {
            cfg.upload.enabled = enabled;
        }
        if let Some(outbox_dir) = upload.outbox_dir {
            cfg.upload.outbox_dir = outbox_dir;
        }
        if let Some(value) = upload.settle_timeout_ms {
            cfg.upload.settle_timeout_ms = value;
        }
    }

    if let Some(payload) = partial.payload {
        if let Some(value) = payload.compression_level {
            cfg.payload.compression_level = value;
        }
        if let Some(value) = payload.max_payload_bytes {
            cfg.payload.max_payload_bytes = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.path {
            cfg.logging.path = path;
        }
        if let Some(level) = logging.level {
            cfg.logging.level = level;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(order) = overrides.order {
        cfg.crash_reports.order = order;
    }
    if overrides.no_crash_reports {
        cfg.crash_reports.enabled = false;
    }
}

pub fn resolve_paths(process_cwd: &Path, cfg: &AppConfig, overrides: &CliOverrides) -> RuntimePaths {
    let data_dir = overrides
        .data_dir
        .as_deref()
        .map(|dir| absolutize_path(process_cwd, dir))
        .unwrap_or_else(|| process_cwd.to_path_buf());

    RuntimePaths {
        session_db: absolutize_path(&data_dir, &cfg.storage.path),
        crash_dir: absolutize_path(&data_dir, &cfg.crash_reports.directory),
        outbox_dir: absolutize_path(&data_dir, &cfg.upload.outbox_dir),
        log_path: absolutize_path(&data_dir, &cfg.logging.path),
        data_dir,
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), RecoveryError> {
    if cfg.payload.compression_level > 9 {
        return Err(RecoveryError::InvalidConfig(
            "payload.compression_level must be between 0 and 9".to_string(),
        ));
    }
    if cfg.payload.max_payload_bytes == 0 {
        return Err(RecoveryError::InvalidConfig(
            "payload.max_payload_bytes must be greater than zero".to_string(),
        ));
    }
    if LogLevel::parse(&cfg.logging.level).is_none() {
        return Err(RecoveryError::InvalidConfig(format!(
            "logging.level must be one of debug, info, warn, error (got {:?})",
            cfg.logging.level
        )));
    }
    if cfg.storage.path.as_os_str().is_empty() {
        return Err(RecoveryError::InvalidConfig(
            "storage.path must not be empty".to_string(),
        ));
    }
    if cfg.upload.outbox_dir.as_os_str().is_empty() {
        return Err(RecoveryError::InvalidConfig(
            "upload.outbox_dir must not be empty".to_string(),
        ));
    }
    Ok(())
}
