//! Import job record and its lifecycle types.
//!
//! One `ImportJob` document exists per uploaded file. It is the durable
//! source of truth for progress: the push channel is only a projection of
//! what gets written here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cap on stored row-level error strings. The count keeps growing past the
/// cap; only the messages are bounded.
pub const ROW_ERROR_CAP: usize = 20;

/// Ring-buffer cap on debug log lines; newest lines are retained.
pub const DEBUG_LOG_CAP: usize = 50;

/// Declared type of an uploaded file. Column layouts are hardcoded per
/// source, so the client must say which system produced the export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    DealerMaster,
    Contracts,
    Units,
    /// Exterior/interior service report ("ZIE").
    Zie,
    Billing,
    CampaignResults,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::DealerMaster => "dealer-master",
            FileKind::Contracts => "contracts",
            FileKind::Units => "units",
            FileKind::Zie => "zie",
            FileKind::Billing => "billing",
            FileKind::CampaignResults => "campaign-results",
        }
    }
}

/// Lifecycle status. Transitions are one-directional except the explicit
/// reset action, which returns a failed or stuck job to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Imported,
    ImportFailed,
}

/// Where the job's raw bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RawDataRef {
    /// Assembled buffer stored inline on the job document (base64).
    #[serde(rename_all = "camelCase")]
    Inline { data_b64: String },
    /// Bytes still live as chunks under an upload id.
    #[serde(rename_all = "camelCase")]
    Chunked { upload_id: String },
    /// Bytes were discarded after a successful import. Re-import is
    /// impossible without a fresh upload.
    Discarded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: Uuid,
    pub filename: String,
    pub file_kind: FileKind,
    pub status: JobStatus,
    /// Optional reporting period supplied at upload time.
    pub year: Option<i32>,
    pub month: Option<u32>,
    /// Set at most once per job; the first writer wins.
    pub records_total: Option<u64>,
    pub processed_rows: u64,
    pub imported_count: u64,
    /// Capped list of row-level error messages.
    pub row_errors: Vec<String>,
    pub row_error_count: u64,
    /// Top-level failure message when the whole file was rejected.
    pub error: Option<String>,
    /// Current phase name for multi-phase imports.
    pub phase: Option<String>,
    /// Percent through the current phase; resets to 0 at each phase start.
    pub step_pct: u8,
    pub debug_log: Vec<String>,
    pub raw_data: RawDataRef,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(
        filename: String,
        file_kind: FileKind,
        year: Option<i32>,
        month: Option<u32>,
        raw_data: RawDataRef,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            filename,
            file_kind,
            status: JobStatus::Pending,
            year,
            month,
            records_total: None,
            processed_rows: 0,
            imported_count: 0,
            row_errors: Vec::new(),
            row_error_count: 0,
            error: None,
            phase: None,
            step_pct: 0,
            debug_log: Vec::new(),
            raw_data,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_row_error(&mut self, message: String) {
        if self.row_errors.len() < ROW_ERROR_CAP {
            self.row_errors.push(message);
        }
        self.row_error_count += 1;
    }

    /// Append a timestamped debug line, dropping the oldest past the cap.
    pub fn push_debug(&mut self, line: impl Into<String>) {
        let stamped = format!(
            "{} {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            line.into()
        );
        self.debug_log.push(stamped);
        if self.debug_log.len() > DEBUG_LOG_CAP {
            let overflow = self.debug_log.len() - DEBUG_LOG_CAP;
            self.debug_log.drain(0..overflow);
        }
    }
}

/// Push-channel events for one import job. `Start` is emitted once,
/// `Progress` repeatedly, and exactly one of `Done` or `Error` terminates
/// the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    Start,
    #[serde(rename_all = "camelCase")]
    Progress { pct: u8, message: String },
    #[serde(rename_all = "camelCase")]
    Done {
        imported_count: u64,
        total_count: u64,
        errors: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

/// Timestamped wrapper published on the per-job status subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: ProgressEvent,
}

impl ProgressUpdate {
    pub fn new(job_id: Uuid, event: ProgressEvent) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            event,
        }
    }
}

// ==========================================================================
// Request/response payloads
// ==========================================================================

/// One byte range of an in-flight upload, base64-encoded for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    pub upload_id: String,
    pub index: u32,
    pub data_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub upload_id: String,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeUploadRequest {
    pub upload_id: String,
    pub filename: String,
    pub file_kind: FileKind,
    pub year: Option<i32>,
    pub month: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeUploadResponse {
    pub job_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdRequest {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobActionResponse {
    pub job_id: Uuid,
    pub message: String,
}
