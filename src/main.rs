//! DealerLink Worker - Bulk file ingestion for the dealer portal
//!
//! This worker connects to NATS and handles upload and import messages
//! from the portal frontend.

mod config;
mod decode;
mod error;
mod handlers;
mod importers;
mod services;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::services::chunks::ChunkAssembler;
use crate::store::memory::MemoryStore;
use crate::store::DocumentStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs directory - use LOGS_DIR env var or default to ../logs (relative to worker)
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,dealerlink_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    info!("Starting DealerLink Worker...");

    // Load configuration
    let config = config::Config::from_env()?;
    info!("Configuration loaded");

    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
        (Ok(user), Ok(password)) if !user.is_empty() => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    // Periodic sweep of chunks whose upload was never finalized
    let sweep_store = Arc::clone(&store);
    let chunk_ttl = config.chunk_ttl;
    tokio::spawn(async move {
        let assembler = ChunkAssembler::new(sweep_store);
        let mut interval = tokio::time::interval(chunk_ttl / 4);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = assembler.purge_expired(chunk_ttl).await {
                warn!("Chunk purge failed: {}", e);
            }
        }
    });

    // Start message handlers
    let handler_result = handlers::start_handlers(nats_client, store, &config).await;

    if let Err(e) = handler_result {
        error!("Handler error: {}", e);
        return Err(e);
    }

    Ok(())
}
