use crate::errors::RecoveryError;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, RecoveryError>;
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, RecoveryError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), RecoveryError>;
    fn write_bytes(&self, path: &Path, contents: &[u8]) -> Result<(), RecoveryError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), RecoveryError>;
    fn remove_file(&self, path: &Path) -> Result<(), RecoveryError>;
    fn rename(&self, from: &Path, to: &Path) -> Result<(), RecoveryError>;
    fn exists(&self, path: &Path) -> bool;
    /// Regular files directly inside `path`, sorted by path.
    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>, RecoveryError>;
}

pub trait Terminal: Send + Sync {
    fn stdin_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), RecoveryError>;
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, RecoveryError> {
        std::fs::read_to_string(path).map_err(|e| RecoveryError::Io(e.to_string()))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, RecoveryError> {
        std::fs::read(path).map_err(|e| RecoveryError::Io(e.to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), RecoveryError> {
        std::fs::write(path, contents).map_err(|e| RecoveryError::Io(e.to_string()))
    }

    fn write_bytes(&self, path: &Path, contents: &[u8]) -> Result<(), RecoveryError> {
        use std::io::Write;
        let mut file =
            std::fs::File::create(path).map_err(|e| RecoveryError::Io(e.to_string()))?;
        file.write_all(contents)
            .map_err(|e| RecoveryError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| RecoveryError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), RecoveryError> {
        std::fs::create_dir_all(path).map_err(|e| RecoveryError::Io(e.to_string()))
    }

    fn remove_file(&self, path: &Path) -> Result<(), RecoveryError> {
        std::fs::remove_file(path).map_err(|e| RecoveryError::Io(e.to_string()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), RecoveryError> {
        std::fs::rename(from, to).map_err(|e| RecoveryError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>, RecoveryError> {
        let mut files = std::fs::read_dir(path)
            .map_err(|e| RecoveryError::Io(e.to_string()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdin_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdin())
    }

    fn write_line(&self, line: &str) -> Result<(), RecoveryError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| RecoveryError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, ordered record of collaborator calls so tests can assert
/// ordering across the session store, crash source and upload gateway.
#[derive(Debug, Default, Clone)]
pub struct CallJournal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallJournal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().expect("journal lock").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("journal lock").clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries
            .lock()
            .expect("journal lock")
            .iter()
            .position(|recorded| recorded == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries
            .lock()
            .expect("journal lock")
            .iter()
            .filter(|recorded| recorded.as_str() == entry)
            .count()
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<RecoveryError>>>,
    fail_paths: Arc<Mutex<HashMap<PathBuf, RecoveryError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into().into_bytes());
        fs
    }

    pub fn set_fail_next(&self, error: RecoveryError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    /// Every operation touching `path` fails with `error` until cleared.
    pub fn fail_path(&self, path: impl Into<PathBuf>, error: RecoveryError) {
        self.fail_paths
            .lock()
            .expect("fail paths lock")
            .insert(path.into(), error);
    }

    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("fail paths lock").clear();
        *self.fail_next.lock().expect("fail lock") = None;
    }

    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.dirs.lock().expect("dirs lock").clone()
    }

    fn maybe_fail(&self, path: &Path) -> Result<(), RecoveryError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        if let Some(err) = self.fail_paths.lock().expect("fail paths lock").get(path) {
            return Err(err.clone());
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, RecoveryError> {
        let bytes = self.read_bytes(path)?;
        String::from_utf8(bytes).map_err(|e| RecoveryError::Io(e.to_string()))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, RecoveryError> {
        self.maybe_fail(path)?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| RecoveryError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), RecoveryError> {
        self.write_bytes(path, contents.as_bytes())
    }

    fn write_bytes(&self, path: &Path, contents: &[u8]) -> Result<(), RecoveryError> {
        self.maybe_fail(path)?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), RecoveryError> {
        self.maybe_fail(path)?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), RecoveryError> {
        self.maybe_fail(path)?;
        self.files
            .lock()
            .expect("files lock")
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| RecoveryError::Io(format!("missing file {}", path.display())))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), RecoveryError> {
        self.maybe_fail(from)?;
        self.maybe_fail(to)?;
        let mut files = self.files.lock().expect("files lock");
        let contents = files
            .remove(from)
            .ok_or_else(|| RecoveryError::Io(format!("missing file {}", from.display())))?;
        files.insert(to.to_path_buf(), contents);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let files = self.files.lock().expect("files lock");
        files.contains_key(path)
            || files.keys().any(|file| file.starts_with(path))
            || self.dirs.lock().expect("dirs lock").iter().any(|dir| dir == path)
    }

    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>, RecoveryError> {
        self.maybe_fail(path)?;
        Ok(self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .filter(|file| file.parent() == Some(path))
            .cloned()
            .collect())
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    pub is_tty: bool,
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new(is_tty: bool) -> Self {
        Self {
            is_tty,
            ..Self::default()
        }
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn stdin_is_tty(&self) -> bool {
        self.is_tty
    }

    fn write_line(&self, line: &str) -> Result<(), RecoveryError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}
