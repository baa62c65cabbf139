//! Typed queries for import job records.
//!
//! Thin layer between the pipeline and the [`DocumentStore`] seam: it owns
//! the serialization of [`ImportJob`] and the few read patterns the
//! handlers need. Everything is keyed by the job's UUID.

use serde_json::{json, Value};
use uuid::Uuid;

use super::{collections, DocumentStore, StoreError, UpsertOp};
use crate::types::{ImportJob, JobStatus, RawDataRef};

fn to_doc(job: &ImportJob) -> Result<Value, StoreError> {
    serde_json::to_value(job).map_err(|e| StoreError::Backend(e.to_string()))
}

fn from_doc(doc: Value) -> Result<ImportJob, StoreError> {
    serde_json::from_value(doc).map_err(|e| StoreError::Backend(e.to_string()))
}

fn id_filter(job_id: Uuid) -> Value {
    json!({ "id": job_id })
}

/// Insert or fully replace the job document.
pub async fn save(store: &dyn DocumentStore, job: &ImportJob) -> Result<(), StoreError> {
    let doc = to_doc(job)?;
    store
        .upsert(collections::IMPORT_JOBS, UpsertOp::new(id_filter(job.id), doc))
        .await?;
    Ok(())
}

pub async fn get(
    store: &dyn DocumentStore,
    job_id: Uuid,
) -> Result<Option<ImportJob>, StoreError> {
    match store
        .find_one(collections::IMPORT_JOBS, id_filter(job_id))
        .await?
    {
        Some(doc) => Ok(Some(from_doc(doc)?)),
        None => Ok(None),
    }
}

/// Page of jobs, most recent first, plus the total count.
pub async fn list(
    store: &dyn DocumentStore,
    limit: i64,
    offset: i64,
) -> Result<(Vec<ImportJob>, i64), StoreError> {
    let docs = store.find(collections::IMPORT_JOBS, json!({})).await?;
    let total = docs.len() as i64;

    let mut jobs = docs
        .into_iter()
        .map(from_doc)
        .collect::<Result<Vec<_>, _>>()?;
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let offset = offset.max(0) as usize;
    let limit = limit.max(0) as usize;
    let page = jobs.into_iter().skip(offset).take(limit).collect();
    Ok((page, total))
}

/// Record the file's total row count. The first writer wins; later calls
/// return the already-stored total untouched. Returns the effective total.
pub async fn set_records_total(
    store: &dyn DocumentStore,
    job_id: Uuid,
    total: u64,
) -> Result<u64, StoreError> {
    let Some(mut job) = get(store, job_id).await? else {
        return Err(StoreError::Backend(format!("job {} not found", job_id)));
    };
    if let Some(existing) = job.records_total {
        return Ok(existing);
    }
    job.records_total = Some(total);
    job.updated_at = chrono::Utc::now();
    save(store, &job).await?;
    Ok(total)
}

/// Return a failed or stuck job to `Pending` with its counters cleared.
/// The raw data reference is preserved so the import can run again.
pub async fn reset(store: &dyn DocumentStore, job_id: Uuid) -> Result<ImportJob, StoreError> {
    let Some(mut job) = get(store, job_id).await? else {
        return Err(StoreError::Backend(format!("job {} not found", job_id)));
    };
    job.status = JobStatus::Pending;
    job.records_total = None;
    job.processed_rows = 0;
    job.imported_count = 0;
    job.row_errors.clear();
    job.row_error_count = 0;
    job.error = None;
    job.phase = None;
    job.step_pct = 0;
    job.updated_at = chrono::Utc::now();
    save(store, &job).await?;
    Ok(job)
}

/// Delete the job record and, when its bytes still live as chunks, the
/// chunks under its upload id too.
pub async fn delete(store: &dyn DocumentStore, job_id: Uuid) -> Result<bool, StoreError> {
    let Some(job) = get(store, job_id).await? else {
        return Ok(false);
    };
    if let RawDataRef::Chunked { upload_id } = &job.raw_data {
        store
            .delete_many(collections::UPLOAD_CHUNKS, json!({ "uploadId": upload_id }))
            .await?;
    }
    let removed = store
        .delete_many(collections::IMPORT_JOBS, id_filter(job_id))
        .await?;
    Ok(removed > 0)
}
