//! Import job message handlers

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::services::orchestrator::ImportOrchestrator;
use crate::store::{jobs, DocumentStore};
use crate::types::{
    ErrorResponse, JobActionResponse, JobIdRequest, JobStatus, ListRequest, ListResponse,
    RawDataRef, Request, SuccessResponse,
};

/// Handle import.jobs.list messages
pub async fn handle_list(
    client: Client,
    mut subscriber: Subscriber,
    store: Arc<dyn DocumentStore>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        debug!("Received import.jobs.list message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message without reply subject");
                continue;
            }
        };

        let request: Request<ListRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let ListRequest { limit, offset } = request.payload;
        match jobs::list(store.as_ref(), limit, offset).await {
            Ok((items, total)) => {
                let response = SuccessResponse::new(
                    request.id,
                    ListResponse {
                        items,
                        total,
                        limit,
                        offset,
                    },
                );
                let _ = client.publish(reply, serde_json::to_vec(&response)?.into()).await;
                debug!("Listed {} import jobs", response.payload.items.len());
            }
            Err(e) => {
                error!("Failed to list import jobs: {}", e);
                let error = ErrorResponse::new(request.id, "STORE_ERROR", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.jobs.get messages
pub async fn handle_get(
    client: Client,
    mut subscriber: Subscriber,
    store: Arc<dyn DocumentStore>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        debug!("Received import.jobs.get message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message without reply subject");
                continue;
            }
        };

        let request: Request<JobIdRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        match jobs::get(store.as_ref(), request.payload.job_id).await {
            Ok(Some(job)) => {
                let response = SuccessResponse::new(request.id, job);
                let _ = client.publish(reply, serde_json::to_vec(&response)?.into()).await;
            }
            Ok(None) => {
                let error = ErrorResponse::new(
                    request.id,
                    "NOT_FOUND",
                    format!("Import job {} not found", request.payload.job_id),
                );
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
            Err(e) => {
                error!("Failed to load import job: {}", e);
                let error = ErrorResponse::new(request.id, "STORE_ERROR", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.jobs.reset messages
pub async fn handle_reset(
    client: Client,
    mut subscriber: Subscriber,
    store: Arc<dyn DocumentStore>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        debug!("Received import.jobs.reset message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message without reply subject");
                continue;
            }
        };

        let request: Request<JobIdRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        match jobs::reset(store.as_ref(), request.payload.job_id).await {
            Ok(job) => {
                info!("Reset import job {}", job.id);
                let response = SuccessResponse::new(
                    request.id,
                    JobActionResponse {
                        job_id: job.id,
                        message: "Job reset to pending".to_string(),
                    },
                );
                let _ = client.publish(reply, serde_json::to_vec(&response)?.into()).await;
            }
            Err(e) => {
                error!("Failed to reset import job: {}", e);
                let error = ErrorResponse::new(request.id, "STORE_ERROR", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.jobs.delete messages
pub async fn handle_delete(
    client: Client,
    mut subscriber: Subscriber,
    store: Arc<dyn DocumentStore>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        debug!("Received import.jobs.delete message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message without reply subject");
                continue;
            }
        };

        let request: Request<JobIdRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let job_id = request.payload.job_id;
        match jobs::delete(store.as_ref(), job_id).await {
            Ok(true) => {
                info!("Deleted import job {}", job_id);
                let response = SuccessResponse::new(
                    request.id,
                    JobActionResponse {
                        job_id,
                        message: "Job deleted".to_string(),
                    },
                );
                let _ = client.publish(reply, serde_json::to_vec(&response)?.into()).await;
            }
            Ok(false) => {
                let error = ErrorResponse::new(
                    request.id,
                    "NOT_FOUND",
                    format!("Import job {} not found", job_id),
                );
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
            Err(e) => {
                error!("Failed to delete import job: {}", e);
                let error = ErrorResponse::new(request.id, "STORE_ERROR", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.start messages
///
/// Re-triggers the import for an existing job, e.g. after a reset. The
/// reply confirms the trigger; the run itself happens in the background.
pub async fn handle_start(
    client: Client,
    mut subscriber: Subscriber,
    store: Arc<dyn DocumentStore>,
    orchestrator: Arc<ImportOrchestrator>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        debug!("Received import.start message");

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message without reply subject");
                continue;
            }
        };

        let request: Request<JobIdRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let job_id = request.payload.job_id;
        let job = match jobs::get(store.as_ref(), job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let error = ErrorResponse::new(
                    request.id,
                    "NOT_FOUND",
                    format!("Import job {} not found", job_id),
                );
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
            Err(e) => {
                error!("Failed to load import job: {}", e);
                let error = ErrorResponse::new(request.id, "STORE_ERROR", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        if job.status == JobStatus::Processing {
            let error = ErrorResponse::new(
                request.id,
                "ALREADY_PROCESSING",
                format!("Import job {} is already running", job_id),
            );
            let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            continue;
        }
        if job.raw_data == RawDataRef::Discarded {
            let error = ErrorResponse::new(
                request.id,
                "DATA_NOT_FOUND",
                format!("Raw data for job {} was discarded; upload the file again", job_id),
            );
            let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            continue;
        }

        let response = SuccessResponse::new(
            request.id,
            JobActionResponse {
                job_id,
                message: "Import started".to_string(),
            },
        );
        let _ = client.publish(reply, serde_json::to_vec(&response)?.into()).await;

        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run_import(job_id).await {
                error!("Import of job {} failed: {}", job_id, e);
            }
        });
    }

    Ok(())
}
