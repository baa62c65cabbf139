//! Import Orchestrator and progress reporting.
//!
//! Drives one job through `pending -> processing -> imported` (or
//! `import_failed`), with the job record as the durable source of truth
//! and a per-job NATS status subject as a best-effort projection of it.
//! Decode runs on a blocking thread while the async side keeps emitting
//! heartbeats. The contracts source runs as three strictly ordered
//! phases, each re-decoding the raw buffer so no phase depends on
//! another's in-memory state.

use std::sync::Arc;
use std::time::Duration;

use async_nats::Client;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::decode::{self, DecodedSheet};
use crate::error::ImportError;
use crate::importers::{self, contracts::ContractPhase, ImportContext, ImportOutcome, ProgressSink};
use crate::services::bulk::BulkConfig;
use crate::services::chunks::ChunkAssembler;
use crate::store::{jobs, DocumentStore, StoreError};
use crate::types::{FileKind, ImportJob, JobStatus, ProgressEvent, ProgressUpdate, RawDataRef, ROW_ERROR_CAP};

/// Per-job status subject prefix; the job id is the last token.
pub const STATUS_PREFIX: &str = "dealerlink.job.import.status";

/// Coarse liveness thresholds mirrored into the job's debug log.
const DEBUG_THRESHOLDS: [u8; 5] = [0, 25, 50, 75, 100];

pub struct ImportOrchestrator {
    client: Option<Client>,
    store: Arc<dyn DocumentStore>,
    config: Config,
}

impl ImportOrchestrator {
    /// `client: None` runs the same pipeline without the push channel
    /// (local mode and tests); the job record still carries everything.
    pub fn new(client: Option<Client>, store: Arc<dyn DocumentStore>, config: Config) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    fn bulk_config(&self) -> BulkConfig {
        BulkConfig {
            batch_size: self.config.bulk_batch_size,
            parallelism: self.config.bulk_parallelism,
            per_batch_timeout: self.config.bulk_batch_timeout,
        }
    }

    /// Publish one push event. Failures are deliberately dropped; a dead
    /// listener must never affect the import.
    async fn publish(&self, job_id: Uuid, event: ProgressEvent) {
        let Some(client) = &self.client else {
            return;
        };
        let update = ProgressUpdate::new(job_id, event);
        let subject = format!("{}.{}", STATUS_PREFIX, job_id);
        match serde_json::to_vec(&update) {
            Ok(payload) => {
                if let Err(e) = client.publish(subject, payload.into()).await {
                    debug!("Dropping status event for job {}: {}", job_id, e);
                }
            }
            Err(e) => warn!("Failed to serialize status event for job {}: {}", job_id, e),
        }
    }

    /// Run (or re-run) the import for an existing job.
    ///
    /// Always leaves the job record in a terminal state (`imported` or
    /// `import_failed`) unless the job was already mid-`processing`, in
    /// which case the duplicate trigger is ignored.
    pub async fn run_import(&self, job_id: Uuid) -> Result<(), ImportError> {
        let Some(job) = jobs::get(self.store.as_ref(), job_id).await? else {
            return Err(ImportError::Store(StoreError::Backend(format!(
                "job {} not found",
                job_id
            ))));
        };
        if job.status == JobStatus::Processing {
            warn!("Job {} is already processing; ignoring duplicate trigger", job_id);
            return Ok(());
        }

        match self.execute(job).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_failed(job_id, &e).await;
                self.publish(
                    job_id,
                    ProgressEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                Err(e)
            }
        }
    }

    async fn execute(&self, mut job: ImportJob) -> Result<(), ImportError> {
        let job_id = job.id;
        let buffer = self.load_raw_bytes(&mut job).await?;

        job.status = JobStatus::Processing;
        job.error = None;
        job.step_pct = 0;
        job.push_debug(format!("import started ({} bytes)", buffer.len()));
        job.updated_at = Utc::now();
        jobs::save(self.store.as_ref(), &job).await?;
        self.publish(job_id, ProgressEvent::Start).await;
        info!("Job {} started: {} ({})", job_id, job.filename, job.file_kind.as_str());

        let sheets = self.decode_with_heartbeat(job_id, &buffer, job.file_kind, job.year).await?;
        let total_rows: u64 = sheets.iter().map(|s| s.rows.len() as u64).sum();
        let total_rows = jobs::set_records_total(self.store.as_ref(), job_id, total_rows).await?;

        let ctx = ImportContext {
            year: job.year,
            month: job.month,
            bulk: self.bulk_config(),
        };

        let outcome = match job.file_kind {
            FileKind::Contracts => {
                self.run_contract_phases(job_id, &buffer, &ctx, job.year).await?
            }
            kind => {
                let sink = self.sink(job_id, None);
                self.run_single(kind, &sheets, &ctx, &sink).await?
            }
        };

        self.mark_imported(job_id, &outcome, total_rows).await?;
        self.publish(
            job_id,
            ProgressEvent::Done {
                imported_count: outcome.imported_count,
                total_count: total_rows,
                errors: outcome.row_errors.clone(),
            },
        )
        .await;
        info!(
            "Job {} imported: {}/{} rows, {} row errors",
            job_id, outcome.imported_count, total_rows, outcome.row_error_count
        );
        Ok(())
    }

    async fn run_single(
        &self,
        kind: FileKind,
        sheets: &[DecodedSheet],
        ctx: &ImportContext,
        sink: &Arc<dyn ProgressSink>,
    ) -> Result<ImportOutcome, ImportError> {
        match kind {
            FileKind::DealerMaster => importers::dealer_master::import(&self.store, sheets, ctx, sink).await,
            FileKind::Units => importers::units::import(&self.store, sheets, ctx, sink).await,
            FileKind::Zie => importers::zie::import(&self.store, sheets, ctx, sink).await,
            FileKind::Billing => importers::billing::import(&self.store, sheets, ctx, sink).await,
            FileKind::CampaignResults => importers::campaign::import(&self.store, sheets, ctx, sink).await,
            FileKind::Contracts => unreachable!("contracts runs as phases"),
        }
    }

    /// Dealers, then customers, then contracts. Each phase re-reads the
    /// job, resets its step percentage, and decodes the buffer from
    /// scratch; earlier phases' writes stay even if a later phase fails.
    async fn run_contract_phases(
        &self,
        job_id: Uuid,
        buffer: &[u8],
        ctx: &ImportContext,
        fallback_year: Option<i32>,
    ) -> Result<ImportOutcome, ImportError> {
        let mut combined = ImportOutcome::default();

        for phase in ContractPhase::ALL {
            let Some(mut job) = jobs::get(self.store.as_ref(), job_id).await? else {
                return Err(ImportError::Store(StoreError::Backend(format!(
                    "job {} disappeared mid-import",
                    job_id
                ))));
            };
            job.phase = Some(phase.name().to_string());
            job.step_pct = 0;
            job.push_debug(format!("phase '{}' started", phase.name()));
            job.updated_at = Utc::now();
            jobs::save(self.store.as_ref(), &job).await?;

            let sheets = self
                .decode_with_heartbeat(job_id, buffer, FileKind::Contracts, fallback_year)
                .await?;
            let sink = self.sink(job_id, Some(phase.name()));
            let outcome = importers::contracts::import_phase(&self.store, &sheets, phase, ctx, &sink)
                .await
                .map_err(|e| {
                    error!("Job {} phase '{}' failed: {}", job_id, phase.name(), e);
                    e
                })?;

            combined.total_rows = combined.total_rows.max(outcome.total_rows);
            // The job's imported total is the final (contracts) phase's
            // count; the dealer and customer phase counts only show up in
            // the debug log lines below.
            combined.imported_count = outcome.imported_count;
            combined.row_error_count += outcome.row_error_count;
            for msg in outcome.row_errors {
                if combined.row_errors.len() < ROW_ERROR_CAP {
                    combined.row_errors.push(msg);
                }
            }

            if let Some(mut job) = jobs::get(self.store.as_ref(), job_id).await? {
                job.step_pct = 100;
                job.push_debug(format!(
                    "phase '{}' finished: {} upserts",
                    phase.name(),
                    outcome.imported_count
                ));
                job.updated_at = Utc::now();
                jobs::save(self.store.as_ref(), &job).await?;
            }
        }
        Ok(combined)
    }

    /// Decode on a blocking thread while emitting liveness heartbeats.
    async fn decode_with_heartbeat(
        &self,
        job_id: Uuid,
        buffer: &[u8],
        kind: FileKind,
        fallback_year: Option<i32>,
    ) -> Result<Vec<DecodedSheet>, ImportError> {
        let owned = buffer.to_vec();
        let mut handle = tokio::task::spawn_blocking(move || decode::decode(&owned, kind, fallback_year));
        let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
        heartbeat.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                result = &mut handle => {
                    let sheets = result
                        .map_err(|e| ImportError::structural(format!("decode task failed: {}", e)))??;
                    return Ok(sheets);
                }
                _ = heartbeat.tick() => {
                    self.publish(
                        job_id,
                        ProgressEvent::Progress {
                            pct: 0,
                            message: "Decoding file".into(),
                        },
                    )
                    .await;
                }
            }
        }
    }

    /// Resolve the job's raw bytes. Chunked uploads are assembled once and
    /// pinned inline on the job so later phases and retries can re-read
    /// them without the chunks.
    async fn load_raw_bytes(&self, job: &mut ImportJob) -> Result<Vec<u8>, ImportError> {
        match &job.raw_data {
            RawDataRef::Inline { data_b64 } => BASE64
                .decode(data_b64)
                .map_err(|e| ImportError::structural(format!("stored raw data is corrupt: {}", e))),
            RawDataRef::Chunked { upload_id } => {
                let assembler = ChunkAssembler::new(Arc::clone(&self.store));
                let buffer = assembler.finalize(upload_id).await?;
                job.raw_data = RawDataRef::Inline {
                    data_b64: BASE64.encode(&buffer),
                };
                job.updated_at = Utc::now();
                jobs::save(self.store.as_ref(), job).await?;
                Ok(buffer)
            }
            RawDataRef::Discarded => Err(ImportError::DataNotFound(job.id)),
        }
    }

    async fn mark_imported(
        &self,
        job_id: Uuid,
        outcome: &ImportOutcome,
        total_rows: u64,
    ) -> Result<(), ImportError> {
        let Some(mut job) = jobs::get(self.store.as_ref(), job_id).await? else {
            return Ok(());
        };
        job.status = JobStatus::Imported;
        job.processed_rows = total_rows;
        job.imported_count = outcome.imported_count;
        job.row_errors = outcome.row_errors.clone();
        job.row_error_count = outcome.row_error_count;
        job.error = None;
        job.phase = None;
        job.step_pct = 100;
        // Successful imports drop the source bytes; re-import needs a
        // fresh upload.
        job.raw_data = RawDataRef::Discarded;
        if outcome.row_error_count > 0 {
            job.push_debug(format!("{} rows had errors", outcome.row_error_count));
        }
        job.push_debug("import finished");
        job.updated_at = Utc::now();
        jobs::save(self.store.as_ref(), &job).await?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &ImportError) {
        let job = match jobs::get(self.store.as_ref(), job_id).await {
            Ok(Some(job)) => Some(job),
            Ok(None) => None,
            Err(e) => {
                error!("Could not load job {} to record failure: {}", job_id, e);
                None
            }
        };
        let Some(mut job) = job else { return };

        job.status = JobStatus::ImportFailed;
        job.error = Some(error.to_string());
        job.push_debug(format!("import failed: {}", error));
        job.updated_at = Utc::now();
        if let Err(e) = jobs::save(self.store.as_ref(), &job).await {
            error!("Could not persist failure for job {}: {}", job_id, e);
        }
    }

    fn sink(&self, job_id: Uuid, phase: Option<&'static str>) -> Arc<dyn ProgressSink> {
        Arc::new(JobProgressSink {
            client: self.client.clone(),
            store: Arc::clone(&self.store),
            job_id,
            phase,
            write_interval: self.config.progress_write_interval,
            state: Mutex::new(SinkState {
                last_write: None,
                last_threshold: None,
            }),
        })
    }
}

struct SinkState {
    last_write: Option<Instant>,
    last_threshold: Option<u8>,
}

/// Bridges the bulk engine's wave callbacks to the job record and the
/// push channel. Job writes are throttled; threshold crossings always
/// write so the debug log stays coarse but complete.
struct JobProgressSink {
    client: Option<Client>,
    store: Arc<dyn DocumentStore>,
    job_id: Uuid,
    phase: Option<&'static str>,
    write_interval: Duration,
    state: Mutex<SinkState>,
}

impl JobProgressSink {
    fn crossed_threshold(&self, pct: u8) -> Option<u8> {
        let state = self.state.lock();
        DEBUG_THRESHOLDS
            .iter()
            .rev()
            .find(|t| pct >= **t)
            .copied()
            .filter(|t| state.last_threshold.map_or(true, |last| *t > last))
    }

    fn should_write(&self, threshold: Option<u8>) -> bool {
        let mut state = self.state.lock();
        let due = state
            .last_write
            .map_or(true, |last| last.elapsed() >= self.write_interval);
        if due || threshold.is_some() {
            state.last_write = Some(Instant::now());
            if let Some(t) = threshold {
                state.last_threshold = Some(t);
            }
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl ProgressSink for JobProgressSink {
    async fn on_progress(&self, done: usize, total: usize, message: &str) {
        let pct = if total > 0 {
            ((done as f64 / total as f64) * 100.0).round().min(100.0) as u8
        } else {
            0
        };

        let threshold = self.crossed_threshold(pct);
        if self.should_write(threshold) {
            match jobs::get(self.store.as_ref(), self.job_id).await {
                Ok(Some(mut job)) => {
                    let processed = done as u64;
                    job.processed_rows = match job.records_total {
                        Some(total) => processed.min(total),
                        None => processed,
                    };
                    job.step_pct = pct;
                    if let Some(t) = threshold {
                        let phase = self.phase.unwrap_or("import");
                        job.push_debug(format!("{}: {}% ({}/{})", phase, t, done, total));
                    }
                    job.updated_at = Utc::now();
                    if let Err(e) = jobs::save(self.store.as_ref(), &job).await {
                        warn!("Progress write for job {} failed: {}", self.job_id, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Progress read for job {} failed: {}", self.job_id, e),
            }
        }

        if let Some(client) = &self.client {
            let update = ProgressUpdate::new(
                self.job_id,
                ProgressEvent::Progress {
                    pct,
                    message: message.to_string(),
                },
            );
            if let Ok(payload) = serde_json::to_vec(&update) {
                let subject = format!("{}.{}", STATUS_PREFIX, self.job_id);
                let _ = client.publish(subject, payload.into()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::collections;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn config() -> Config {
        Config {
            nats_url: "nats://localhost:4222".into(),
            chunk_ttl: Duration::from_secs(3600),
            bulk_batch_size: 10,
            bulk_parallelism: 2,
            bulk_batch_timeout: Duration::from_secs(5),
            progress_write_interval: Duration::from_millis(0),
        }
    }

    fn orchestrator(store: &Arc<dyn DocumentStore>) -> ImportOrchestrator {
        ImportOrchestrator::new(None, Arc::clone(store), config())
    }

    async fn make_job(store: &Arc<dyn DocumentStore>, kind: FileKind, data: &[u8]) -> ImportJob {
        let job = ImportJob::new(
            "upload.csv".into(),
            kind,
            Some(2024),
            Some(3),
            RawDataRef::Inline {
                data_b64: BASE64.encode(data),
            },
        );
        jobs::save(store.as_ref(), &job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_structural_failure_ends_import_failed_with_no_writes() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(&store);
        // Header is missing the dealer code column entirely.
        let job = make_job(&store, FileKind::DealerMaster, b"Dealer Name\nFirst Honda\nAcura\nThird\n").await;

        assert!(orch.run_import(job.id).await.is_err());

        let job = jobs::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::ImportFailed);
        assert!(job.error.as_deref().unwrap_or("").contains("required columns"));
        assert_eq!(store.count(collections::DEALERS, json!({})).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_partial_success_imports_and_records_row_error() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(&store);
        let csv = b"Dealer Code,Dealer Name\n0042,First Honda\n,No Code Motors\n0043,Acura of Peoria\n";
        let job = make_job(&store, FileKind::DealerMaster, csv).await;

        orch.run_import(job.id).await.unwrap();

        let job = jobs::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Imported);
        assert_eq!(job.records_total, Some(3));
        assert_eq!(job.imported_count, 2);
        assert_eq!(job.row_error_count, 1);
        assert_eq!(job.raw_data, RawDataRef::Discarded);
        assert!(job.debug_log.iter().any(|l| l.contains("import finished")));
        assert_eq!(store.count(collections::DEALERS, json!({})).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reimport_of_corrected_file_does_not_duplicate() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(&store);
        let csv = b"Dealer Code,Dealer Name\n0042,First Honda\n,No Code Motors\n0043,Acura of Peoria\n";
        let job = make_job(&store, FileKind::DealerMaster, csv).await;
        orch.run_import(job.id).await.unwrap();

        // Corrected file arrives as a fresh upload.
        let fixed = b"Dealer Code,Dealer Name\n0042,First Honda\n0043,Acura of Peoria\n";
        let job2 = make_job(&store, FileKind::DealerMaster, fixed).await;
        orch.run_import(job2.id).await.unwrap();

        assert_eq!(store.count(collections::DEALERS, json!({})).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_discarded_raw_data_rejects_reimport() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(&store);
        let csv = b"Dealer Code,Dealer Name\n0042,First Honda\n";
        let job = make_job(&store, FileKind::DealerMaster, csv).await;
        orch.run_import(job.id).await.unwrap();

        // Bytes were discarded on success; a retry needs a new upload.
        let err = orch.run_import(job.id).await.unwrap_err();
        assert!(matches!(err, ImportError::DataNotFound(_)));
    }

    #[tokio::test]
    async fn test_contract_phases_run_in_order_and_log() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(&store);
        let csv = b"Dealer Code,Agreement,Agreement Suffix,Customer Email,Expiration Date\n\
0042,A1000,01,jane@example.com,01/15/2030\n\
0043,A1001,01,bob@example.com,01/15/2030\n";
        let job = make_job(&store, FileKind::Contracts, csv).await;

        orch.run_import(job.id).await.unwrap();

        let job = jobs::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Imported);
        assert_eq!(store.count(collections::DEALERS, json!({})).await.unwrap(), 2);
        assert_eq!(store.count(collections::CUSTOMERS, json!({})).await.unwrap(), 2);
        assert_eq!(store.count(collections::CONTRACTS, json!({})).await.unwrap(), 2);

        // The job reports the contract count, not the sum across phases.
        assert_eq!(job.records_total, Some(2));
        assert_eq!(job.imported_count, 2);

        // Phase markers appear in execution order.
        let log = job.debug_log.join("\n");
        let d = log.find("phase 'dealers' started").unwrap();
        let c = log.find("phase 'customers' started").unwrap();
        let k = log.find("phase 'contracts' started").unwrap();
        assert!(d < c && c < k);
    }

    #[tokio::test]
    async fn test_chunked_job_assembles_then_pins_inline() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(&store);

        let csv = b"Dealer Code,Dealer Name\n0042,First Honda\n";
        let assembler = ChunkAssembler::new(Arc::clone(&store));
        let half = csv.len() / 2;
        assembler
            .store_chunk("u-7", 0, &BASE64.encode(&csv[..half]))
            .await
            .unwrap();
        assembler
            .store_chunk("u-7", 1, &BASE64.encode(&csv[half..]))
            .await
            .unwrap();

        let job = ImportJob::new(
            "big.csv".into(),
            FileKind::DealerMaster,
            None,
            None,
            RawDataRef::Chunked {
                upload_id: "u-7".into(),
            },
        );
        jobs::save(store.as_ref(), &job).await.unwrap();

        orch.run_import(job.id).await.unwrap();

        let job = jobs::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Imported);
        assert_eq!(store.count(collections::DEALERS, json!({})).await.unwrap(), 1);
        assert_eq!(
            store
                .count(collections::UPLOAD_CHUNKS, json!({ "uploadId": "u-7" }))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_reset_then_retry_succeeds_after_failure() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let orch = orchestrator(&store);
        // Units file with no reporting period fails structurally but
        // keeps its raw bytes for retry.
        let csv = b"Dealer Name,New,Used\nFirst Honda,10,4\n";
        let mut job = ImportJob::new(
            "units.csv".into(),
            FileKind::Units,
            None,
            None,
            RawDataRef::Inline {
                data_b64: BASE64.encode(csv),
            },
        );
        jobs::save(store.as_ref(), &job).await.unwrap();
        assert!(orch.run_import(job.id).await.is_err());

        let failed = jobs::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::ImportFailed);
        assert_ne!(failed.raw_data, RawDataRef::Discarded);

        // Operator resets and fixes the period, then retries.
        jobs::reset(store.as_ref(), job.id).await.unwrap();
        job = jobs::get(store.as_ref(), job.id).await.unwrap().unwrap();
        job.year = Some(2024);
        job.month = Some(3);
        jobs::save(store.as_ref(), &job).await.unwrap();
        store
            .upsert(
                collections::DEALERS,
                crate::store::UpsertOp::new(
                    json!({ "code": "0042" }),
                    json!({ "id": Uuid::new_v4(), "name": "First Honda" }),
                ),
            )
            .await
            .unwrap();

        orch.run_import(job.id).await.unwrap();
        let job = jobs::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Imported);
        assert_eq!(job.imported_count, 1);
    }
}
