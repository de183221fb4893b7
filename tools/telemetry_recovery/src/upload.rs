use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use crate::errors::RecoveryError;
use crate::logging::append_run_log;
use crate::runtime::{CallJournal, FileSystem};
use crate::types::RecordKind;

pub type DeliveryResult = Result<(), RecoveryError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Failed(String),
    /// The gateway dropped the ticket without reporting.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub kind: RecordKind,
    pub id: String,
    pub status: DeliveryStatus,
}

/// Proof that a gateway accepted custody of a payload. Resolves once the
/// gateway knows whether delivery succeeded.
#[derive(Debug)]
pub struct UploadTicket {
    pub kind: RecordKind,
    pub id: String,
    receiver: oneshot::Receiver<DeliveryResult>,
}

/// Gateway-side half of an [`UploadTicket`].
#[derive(Debug)]
pub struct DeliveryHandle {
    pub kind: RecordKind,
    pub id: String,
    sender: oneshot::Sender<DeliveryResult>,
}

impl DeliveryHandle {
    pub fn complete(self, result: DeliveryResult) {
        let _ = self.sender.send(result);
    }
}

impl UploadTicket {
    pub fn pending(kind: RecordKind, id: impl Into<String>) -> (Self, DeliveryHandle) {
        let id = id.into();
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                kind,
                id: id.clone(),
                receiver,
            },
            DeliveryHandle { kind, id, sender },
        )
    }

    pub fn resolved(kind: RecordKind, id: impl Into<String>, result: DeliveryResult) -> Self {
        let (ticket, handle) = Self::pending(kind, id);
        handle.complete(result);
        ticket
    }

    pub async fn settle(self) -> DeliveryOutcome {
        let status = match self.receiver.await {
            Ok(Ok(())) => DeliveryStatus::Delivered,
            Ok(Err(e)) => DeliveryStatus::Failed(e.to_string()),
            Err(_) => DeliveryStatus::Abandoned,
        };
        DeliveryOutcome {
            kind: self.kind,
            id: self.id,
            status,
        }
    }
}

/// Transport boundary. Returning `Ok` means the gateway holds the payload in
/// its own durable cache and will retry until delivered; it never means the
/// collector has acknowledged it.
pub trait UploadGateway: Send + Sync {
    fn upload_blob(&self, id: &str, data: Vec<u8>) -> Result<UploadTicket, RecoveryError>;
    fn upload_session(&self, id: &str, data: Vec<u8>) -> Result<UploadTicket, RecoveryError>;
}

pub const PAYLOAD_SUFFIX: &str = ".json.gz";
pub const DIGEST_SUFFIX: &str = ".sha256";

/// Gateway that takes custody by writing payloads into an outbox directory
/// drained by the network transport.
///
/// Layout: `<root>/blobs/<id>.json.gz` and `<root>/sessions/<id>.json.gz`,
/// each with a `<id>.sha256` digest written before the payload appears.
/// Tickets resolve as delivered once the payload is durable in the outbox.
pub struct OutboxGateway {
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl OutboxGateway {
    pub fn open(root: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Result<Self, RecoveryError> {
        let root = root.into();
        for kind in [RecordKind::CrashReport, RecordKind::Session] {
            fs.create_dir_all(&root.join(outbox_subdir(kind)))?;
        }
        append_run_log(
            "info",
            "outbox.open",
            json!({ "root": root.display().to_string() }),
        );
        Ok(Self { root, fs })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_path(&self, kind: RecordKind, id: &str) -> PathBuf {
        self.root
            .join(outbox_subdir(kind))
            .join(format!("{id}{PAYLOAD_SUFFIX}"))
    }

    /// Ids currently waiting in the outbox for `kind`.
    pub fn pending_ids(&self, kind: RecordKind) -> Result<Vec<String>, RecoveryError> {
        let dir = self.root.join(outbox_subdir(kind));
        Ok(self
            .fs
            .list_files(&dir)?
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .filter_map(|name| name.strip_suffix(PAYLOAD_SUFFIX))
            .map(str::to_string)
            .collect())
    }

    fn enqueue(&self, kind: RecordKind, id: &str, data: &[u8]) -> Result<UploadTicket, RecoveryError> {
        validate_outbox_id(id)?;
        let payload_path = self.payload_path(kind, id);
        let tmp_path = payload_path.with_extension("gz.tmp");
        let digest_path = self
            .root
            .join(outbox_subdir(kind))
            .join(format!("{id}{DIGEST_SUFFIX}"));
        let digest = format!("{:x}", Sha256::digest(data));

        let accept = |e: RecoveryError| RecoveryError::UploadAccept(format!("{} {id}: {e}", kind.as_str()));
        self.fs
            .write_string(&digest_path, &format!("{digest}  {id}{PAYLOAD_SUFFIX}\n"))
            .map_err(accept)?;
        let written = self
            .fs
            .write_bytes(&tmp_path, data)
            .and_then(|()| self.fs.rename(&tmp_path, &payload_path));
        if let Err(e) = written {
            // A digest must never outlive a payload that failed to land.
            let _ = self.fs.remove_file(&tmp_path);
            let _ = self.fs.remove_file(&digest_path);
            return Err(accept(e));
        }

        append_run_log(
            "debug",
            "outbox.payload.accepted",
            json!({
                "kind": kind.as_str(),
                "id": id,
                "bytes": data.len(),
                "sha256": digest,
            }),
        );
        Ok(UploadTicket::resolved(kind, id, Ok(())))
    }
}

impl UploadGateway for OutboxGateway {
    fn upload_blob(&self, id: &str, data: Vec<u8>) -> Result<UploadTicket, RecoveryError> {
        self.enqueue(RecordKind::CrashReport, id, &data)
    }

    fn upload_session(&self, id: &str, data: Vec<u8>) -> Result<UploadTicket, RecoveryError> {
        self.enqueue(RecordKind::Session, id, &data)
    }
}

fn outbox_subdir(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::CrashReport => "blobs",
        RecordKind::Session => "sessions",
    }
}

fn validate_outbox_id(id: &str) -> Result<(), RecoveryError> {
    if id.trim().is_empty() || matches!(id, "." | "..") || id.contains(['/', '\\']) {
        return Err(RecoveryError::UploadAccept(format!(
            "id {id:?} is not a valid outbox key"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckMode {
    /// Resolve every ticket as delivered right away.
    Immediate,
    /// Resolve every ticket with a delivery failure.
    Fail(String),
    /// Keep tickets open until [`FakeUploadGateway::complete_all`].
    Hold,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub kind: RecordKind,
    pub id: String,
    pub data: Vec<u8>,
}

/// Test gateway. Calls are journaled as `upload.blob:<id>` and
/// `upload.session:<id>`; refused enqueues are journaled too.
#[derive(Clone)]
pub struct FakeUploadGateway {
    mode: AckMode,
    uploads: Arc<Mutex<Vec<RecordedUpload>>>,
    held: Arc<Mutex<Vec<DeliveryHandle>>>,
    rejections: Arc<Mutex<HashMap<String, RecoveryError>>>,
    journal: CallJournal,
}

impl FakeUploadGateway {
    pub fn new(mode: AckMode) -> Self {
        Self::with_journal(mode, CallJournal::default())
    }

    pub fn with_journal(mode: AckMode, journal: CallJournal) -> Self {
        Self {
            mode,
            uploads: Arc::new(Mutex::new(Vec::new())),
            held: Arc::new(Mutex::new(Vec::new())),
            rejections: Arc::new(Mutex::new(HashMap::new())),
            journal,
        }
    }

    pub fn reject(&self, id: &str, error: RecoveryError) {
        self.rejections
            .lock()
            .expect("rejections lock")
            .insert(id.to_string(), error);
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().expect("uploads lock").clone()
    }

    pub fn uploaded_ids(&self, kind: RecordKind) -> Vec<String> {
        self.uploads()
            .into_iter()
            .filter(|upload| upload.kind == kind)
            .map(|upload| upload.id)
            .collect()
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().expect("held lock").len()
    }

    pub fn complete_all(&self, result: DeliveryResult) {
        let handles = std::mem::take(&mut *self.held.lock().expect("held lock"));
        for handle in handles {
            handle.complete(result.clone());
        }
    }

    fn accept(&self, kind: RecordKind, id: &str, data: Vec<u8>) -> Result<UploadTicket, RecoveryError> {
        let label = match kind {
            RecordKind::CrashReport => "blob",
            RecordKind::Session => "session",
        };
        self.journal.record(format!("upload.{label}:{id}"));
        if let Some(err) = self.rejections.lock().expect("rejections lock").get(id) {
            return Err(err.clone());
        }
        self.uploads
            .lock()
            .expect("uploads lock")
            .push(RecordedUpload {
                kind,
                id: id.to_string(),
                data,
            });
        let (ticket, handle) = UploadTicket::pending(kind, id);
        match &self.mode {
            AckMode::Immediate => handle.complete(Ok(())),
            AckMode::Fail(reason) => handle.complete(Err(RecoveryError::Delivery(reason.clone()))),
            AckMode::Hold => self.held.lock().expect("held lock").push(handle),
        }
        Ok(ticket)
    }
}

impl UploadGateway for FakeUploadGateway {
    fn upload_blob(&self, id: &str, data: Vec<u8>) -> Result<UploadTicket, RecoveryError> {
        self.accept(RecordKind::CrashReport, id, data)
    }

    fn upload_session(&self, id: &str, data: Vec<u8>) -> Result<UploadTicket, RecoveryError> {
        self.accept(RecordKind::Session, id, data)
    }
}
