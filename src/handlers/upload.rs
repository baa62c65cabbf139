//! Chunked upload message handlers

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::services::chunks::ChunkAssembler;
use crate::services::orchestrator::ImportOrchestrator;
use crate::store::{jobs, DocumentStore};
use crate::types::{
    ErrorResponse, FinalizeUploadRequest, FinalizeUploadResponse, ImportJob, RawDataRef, Request,
    SuccessResponse, UploadChunkRequest, UploadChunkResponse,
};

/// File extensions the pipeline knows how to decode. Legacy .xls (OLE
/// container) is not on the list; only the zip-based .xlsx format is.
const ALLOWED_EXTENSIONS: [&str; 3] = ["csv", "txt", "xlsx"];

fn extension_allowed(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| {
            let ext = ext.to_ascii_lowercase();
            ALLOWED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Handle upload.chunk messages
pub async fn handle_chunk(
    client: Client,
    mut subscriber: Subscriber,
    store: Arc<dyn DocumentStore>,
) -> Result<()> {
    let assembler = ChunkAssembler::new(store);

    while let Some(msg) = subscriber.next().await {
        debug!("Received upload.chunk message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message without reply subject");
                continue;
            }
        };

        let request: Request<UploadChunkRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let UploadChunkRequest {
            upload_id,
            index,
            data_b64,
        } = request.payload;

        match assembler.store_chunk(&upload_id, index, &data_b64).await {
            Ok(()) => {
                let response =
                    SuccessResponse::new(request.id, UploadChunkResponse { upload_id, index });
                let _ = client.publish(reply, serde_json::to_vec(&response)?.into()).await;
            }
            Err(e) => {
                error!("Failed to store chunk {} of upload {}: {}", index, upload_id, e);
                let error = ErrorResponse::new(request.id, "CHUNK_ERROR", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Handle upload.finalize messages
///
/// Validates the upload, creates the job record, replies with the job id,
/// and kicks off the import in the background. The caller follows progress
/// on the per-job status subject or by polling the job record.
pub async fn handle_finalize(
    client: Client,
    mut subscriber: Subscriber,
    store: Arc<dyn DocumentStore>,
    orchestrator: Arc<ImportOrchestrator>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        debug!("Received upload.finalize message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message without reply subject");
                continue;
            }
        };

        let request: Request<FinalizeUploadRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let payload = request.payload;

        // Reject unsupported files before anything is written.
        if !extension_allowed(&payload.filename) {
            warn!("Rejected upload with unsupported filename: {}", payload.filename);
            let error = ErrorResponse::new(
                request.id,
                "UNSUPPORTED_FILE_TYPE",
                format!(
                    "'{}' is not a supported file type (csv, txt, xlsx)",
                    payload.filename
                ),
            );
            let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            continue;
        }

        let job = ImportJob::new(
            payload.filename.clone(),
            payload.file_kind,
            payload.year,
            payload.month,
            RawDataRef::Chunked {
                upload_id: payload.upload_id.clone(),
            },
        );

        if let Err(e) = jobs::save(store.as_ref(), &job).await {
            error!("Failed to create import job: {}", e);
            let error = ErrorResponse::new(request.id, "STORE_ERROR", e.to_string());
            let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            continue;
        }

        info!(
            "Created import job {} for {} ({})",
            job.id,
            payload.filename,
            payload.file_kind.as_str()
        );

        let response = SuccessResponse::new(
            request.id,
            FinalizeUploadResponse {
                job_id: job.id,
                message: "Upload accepted, import started".to_string(),
            },
        );
        let _ = client.publish(reply, serde_json::to_vec(&response)?.into()).await;

        let orchestrator = Arc::clone(&orchestrator);
        let job_id = job.id;
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run_import(job_id).await {
                error!("Import of job {} failed: {}", job_id, e);
            }
        });
    }

    Ok(())
}
