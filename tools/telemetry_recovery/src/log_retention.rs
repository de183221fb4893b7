use crate::errors::RecoveryError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const LOG_EXTENSION: &str = "jsonl";

fn io_err(error: std::io::Error) -> RecoveryError {
    RecoveryError::Io(error.to_string())
}

/// Moves `active` aside as `<stem>-<now_ms>.jsonl` once it has grown to
/// `max_bytes`. Returns the rotated segment, if any.
pub fn rotate_if_larger(
    active: &Path,
    max_bytes: u64,
    now_ms: i64,
) -> Result<Option<PathBuf>, RecoveryError> {
    let len = match fs::metadata(active) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(e)),
    };
    if len < max_bytes {
        return Ok(None);
    }
    let stem = active
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("run");
    let mut segment = active.with_file_name(format!("{stem}-{now_ms}.{LOG_EXTENSION}"));
    let mut attempt = 1;
    while segment.exists() {
        segment = active.with_file_name(format!("{stem}-{now_ms}-{attempt}.{LOG_EXTENSION}"));
        attempt += 1;
    }
    fs::rename(active, &segment).map_err(io_err)?;
    Ok(Some(segment))
}

/// Deletes rotated log segments in `dir`, oldest first, until every `.jsonl`
/// file there fits in `budget_bytes`. The active log is counted but never
/// deleted; other file types are ignored.
pub fn enforce_total_budget(
    dir: &Path,
    active: &Path,
    budget_bytes: u64,
) -> Result<Vec<PathBuf>, RecoveryError> {
    let mut segments: Vec<(Option<SystemTime>, PathBuf, u64)> = Vec::new();
    let mut total = 0_u64;
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
            continue;
        }
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        total = total.saturating_add(meta.len());
        if path != active {
            segments.push((meta.modified().ok(), path, meta.len()));
        }
    }
    segments.sort();

    let mut deleted = Vec::new();
    for (_, path, len) in segments {
        if total <= budget_bytes {
            break;
        }
        fs::remove_file(&path).map_err(io_err)?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }
    Ok(deleted)
}
