use crate::errors::RecoveryError;
use crate::types::{CrashReport, RecordKind, SessionRecord};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{Read, Write};

pub const PAYLOAD_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub enum PayloadRecord<'a> {
    Session(&'a SessionRecord),
    CrashReport(&'a CrashReport),
}

impl PayloadRecord<'_> {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Session(_) => RecordKind::Session,
            Self::CrashReport(_) => RecordKind::CrashReport,
        }
    }

    pub fn record_id(&self) -> String {
        match self {
            Self::Session(session) => session.id.clone(),
            Self::CrashReport(report) => report.id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionPayload<'a> {
    pub format_version: u32,
    pub kind: &'static str,
    pub id: &'a str,
    pub process_id: &'a str,
    pub state: &'static str,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub last_heartbeat_time: i64,
    pub crash_report_id: Option<&'a str>,
    pub cold_start: bool,
    pub clean_exit: bool,
    pub app_terminated: bool,
    pub properties: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a SessionRecord> for SessionPayload<'a> {
    fn from(session: &'a SessionRecord) -> Self {
        Self {
            format_version: PAYLOAD_FORMAT_VERSION,
            kind: RecordKind::Session.as_str(),
            id: &session.id,
            process_id: &session.process_id,
            state: session.state.as_str(),
            start_time: session.start_time,
            end_time: session.end_time,
            last_heartbeat_time: session.last_heartbeat_time,
            crash_report_id: session.crash_report_id.as_deref(),
            cold_start: session.cold_start,
            clean_exit: session.clean_exit,
            app_terminated: session.app_terminated,
            properties: &session.properties,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CrashReportPayload<'a> {
    pub format_version: u32,
    pub kind: &'static str,
    pub id: String,
    pub session_id: Option<&'a str>,
    pub timestamp: Option<i64>,
    pub provider: &'a str,
    pub report: &'a serde_json::Value,
}

impl<'a> From<&'a CrashReport> for CrashReportPayload<'a> {
    fn from(report: &'a CrashReport) -> Self {
        Self {
            format_version: PAYLOAD_FORMAT_VERSION,
            kind: RecordKind::CrashReport.as_str(),
            id: report.id.to_string(),
            session_id: report.session_id.as_deref(),
            timestamp: report.timestamp,
            provider: &report.provider,
            report: &report.report,
        }
    }
}

/// Serializes records to JSON and gzips the result.
///
/// `max_payload_bytes` caps the serialized document before compression; the
/// collector refuses anything larger, so such records fail to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBuilder {
    pub compression_level: u32,
    pub max_payload_bytes: usize,
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl PayloadBuilder {
    pub fn new(compression_level: u32, max_payload_bytes: usize) -> Self {
        Self {
            compression_level,
            max_payload_bytes,
        }
    }

    pub fn build_payload(&self, record: PayloadRecord<'_>) -> Result<Vec<u8>, RecoveryError> {
        let record_id = record.record_id();
        if record_id.trim().is_empty() {
            return Err(RecoveryError::Encoding(format!(
                "{} has an empty id",
                record.kind().as_str()
            )));
        }
        let serialized = match record {
            PayloadRecord::Session(session) => {
                serde_json::to_vec(&SessionPayload::from(session))
            }
            PayloadRecord::CrashReport(report) => {
                serde_json::to_vec(&CrashReportPayload::from(report))
            }
        }
        .map_err(|e| {
            RecoveryError::Encoding(format!(
                "serializing {} {record_id}: {e}",
                record.kind().as_str()
            ))
        })?;

        if serialized.len() > self.max_payload_bytes {
            return Err(RecoveryError::Encoding(format!(
                "{} {record_id} serializes to {} bytes, limit is {}",
                record.kind().as_str(),
                serialized.len(),
                self.max_payload_bytes
            )));
        }

        self.compress(&serialized).map_err(|e| {
            RecoveryError::Encoding(format!(
                "compressing {} {record_id}: {e}",
                record.kind().as_str()
            ))
        })
    }

    pub fn build_session(&self, session: &SessionRecord) -> Result<Vec<u8>, RecoveryError> {
        self.build_payload(PayloadRecord::Session(session))
    }

    pub fn build_crash_report(&self, report: &CrashReport) -> Result<Vec<u8>, RecoveryError> {
        self.build_payload(PayloadRecord::CrashReport(report))
    }

    fn compress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.compression_level));
        encoder.write_all(bytes)?;
        encoder.finish()
    }
}

/// Inflates and parses a payload produced by [`PayloadBuilder`].
pub fn decode_payload(bytes: &[u8]) -> Result<serde_json::Value, RecoveryError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut text = Vec::new();
    decoder
        .read_to_end(&mut text)
        .map_err(|e| RecoveryError::Encoding(format!("inflating payload: {e}")))?;
    serde_json::from_slice(&text)
        .map_err(|e| RecoveryError::Encoding(format!("parsing payload: {e}")))
}
