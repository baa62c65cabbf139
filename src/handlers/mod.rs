//! NATS message handlers

pub mod jobs;
pub mod ping;
pub mod upload;

use std::sync::Arc;

use anyhow::Result;
use async_nats::Client;
use tokio::select;
use tracing::{error, info};

use crate::config::Config;
use crate::services::orchestrator::ImportOrchestrator;
use crate::store::DocumentStore;

/// Start all message handlers
pub async fn start_handlers(
    client: Client,
    store: Arc<dyn DocumentStore>,
    config: &Config,
) -> Result<()> {
    info!("Starting message handlers...");

    let orchestrator = Arc::new(ImportOrchestrator::new(
        Some(client.clone()),
        Arc::clone(&store),
        config.clone(),
    ));

    // Subscribe to all subjects
    let ping_sub = client.subscribe("dealerlink.ping").await?;
    let upload_chunk_sub = client.subscribe("dealerlink.upload.chunk").await?;
    let upload_finalize_sub = client.subscribe("dealerlink.upload.finalize").await?;
    let import_start_sub = client.subscribe("dealerlink.import.start").await?;
    let jobs_list_sub = client.subscribe("dealerlink.import.jobs.list").await?;
    let jobs_get_sub = client.subscribe("dealerlink.import.jobs.get").await?;
    let jobs_reset_sub = client.subscribe("dealerlink.import.jobs.reset").await?;
    let jobs_delete_sub = client.subscribe("dealerlink.import.jobs.delete").await?;

    info!("Subscribed to NATS subjects");

    // Clone for each handler
    let client_ping = client.clone();
    let client_upload_chunk = client.clone();
    let client_upload_finalize = client.clone();
    let client_import_start = client.clone();
    let client_jobs_list = client.clone();
    let client_jobs_get = client.clone();
    let client_jobs_reset = client.clone();
    let client_jobs_delete = client.clone();

    let store_upload_chunk = Arc::clone(&store);
    let store_upload_finalize = Arc::clone(&store);
    let store_import_start = Arc::clone(&store);
    let store_jobs_list = Arc::clone(&store);
    let store_jobs_get = Arc::clone(&store);
    let store_jobs_reset = Arc::clone(&store);
    let store_jobs_delete = Arc::clone(&store);

    let orchestrator_finalize = Arc::clone(&orchestrator);
    let orchestrator_start = Arc::clone(&orchestrator);

    // Spawn handlers
    let ping_handle = tokio::spawn(async move { ping::handle_ping(client_ping, ping_sub).await });

    let upload_chunk_handle = tokio::spawn(async move {
        upload::handle_chunk(client_upload_chunk, upload_chunk_sub, store_upload_chunk).await
    });

    let upload_finalize_handle = tokio::spawn(async move {
        upload::handle_finalize(
            client_upload_finalize,
            upload_finalize_sub,
            store_upload_finalize,
            orchestrator_finalize,
        )
        .await
    });

    let import_start_handle = tokio::spawn(async move {
        jobs::handle_start(
            client_import_start,
            import_start_sub,
            store_import_start,
            orchestrator_start,
        )
        .await
    });

    let jobs_list_handle = tokio::spawn(async move {
        jobs::handle_list(client_jobs_list, jobs_list_sub, store_jobs_list).await
    });

    let jobs_get_handle = tokio::spawn(async move {
        jobs::handle_get(client_jobs_get, jobs_get_sub, store_jobs_get).await
    });

    let jobs_reset_handle = tokio::spawn(async move {
        jobs::handle_reset(client_jobs_reset, jobs_reset_sub, store_jobs_reset).await
    });

    let jobs_delete_handle = tokio::spawn(async move {
        jobs::handle_delete(client_jobs_delete, jobs_delete_sub, store_jobs_delete).await
    });

    info!("All handlers started, waiting for messages...");

    // Wait for any handler to finish (which means an error occurred)
    select! {
        result = ping_handle => {
            error!("Ping handler finished: {:?}", result);
        }
        result = upload_chunk_handle => {
            error!("Upload chunk handler finished: {:?}", result);
        }
        result = upload_finalize_handle => {
            error!("Upload finalize handler finished: {:?}", result);
        }
        result = import_start_handle => {
            error!("Import start handler finished: {:?}", result);
        }
        result = jobs_list_handle => {
            error!("Jobs list handler finished: {:?}", result);
        }
        result = jobs_get_handle => {
            error!("Jobs get handler finished: {:?}", result);
        }
        result = jobs_reset_handle => {
            error!("Jobs reset handler finished: {:?}", result);
        }
        result = jobs_delete_handle => {
            error!("Jobs delete handler finished: {:?}", result);
        }
    }

    Ok(())
}
