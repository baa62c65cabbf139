//! Chunk Assembler
//!
//! Large uploads arrive as indexed base64 chunks under a client-generated
//! upload id. Chunks are stored individually (re-sends overwrite, so
//! retries are idempotent) and reassembled in index order at finalize.
//! Abandoned uploads are purged by a TTL sweep driven from main.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::error::ImportError;
use crate::store::{collections, DocumentStore, UpsertOp};

pub struct ChunkAssembler {
    store: Arc<dyn DocumentStore>,
}

impl ChunkAssembler {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Store one chunk. Keyed by (upload id, index); a re-sent chunk
    /// replaces the previous copy.
    pub async fn store_chunk(
        &self,
        upload_id: &str,
        index: u32,
        data_b64: &str,
    ) -> Result<(), ImportError> {
        // Reject undecodable data at receive time, not at finalize.
        BASE64
            .decode(data_b64)
            .map_err(|e| ImportError::structural(format!("chunk {} is not valid base64: {}", index, e)))?;

        let op = UpsertOp::new(
            json!({ "uploadId": upload_id, "index": index }),
            json!({
                "dataB64": data_b64,
                "createdAt": Utc::now(),
            }),
        );
        self.store.upsert(collections::UPLOAD_CHUNKS, op).await?;
        debug!("Stored chunk {} for upload {}", index, upload_id);
        Ok(())
    }

    /// Reassemble the full buffer from all stored chunks, in index order.
    ///
    /// Fails with `ChunksNotFound` when nothing is stored under the id and
    /// with a structural error when the index sequence has a hole. Chunks
    /// are deleted only after successful assembly.
    pub async fn finalize(&self, upload_id: &str) -> Result<Vec<u8>, ImportError> {
        let docs = self
            .store
            .find(collections::UPLOAD_CHUNKS, json!({ "uploadId": upload_id }))
            .await?;
        if docs.is_empty() {
            return Err(ImportError::ChunksNotFound(upload_id.to_string()));
        }

        let mut chunks: Vec<(u32, String)> = Vec::with_capacity(docs.len());
        for doc in &docs {
            let index = doc
                .get("index")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| ImportError::structural("stored chunk is missing its index"))?;
            let data = doc
                .get("dataB64")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ImportError::structural("stored chunk is missing its data"))?;
            chunks.push((index as u32, data.to_string()));
        }
        chunks.sort_by_key(|(index, _)| *index);

        let mut buffer = Vec::new();
        for (expected, (index, data)) in chunks.iter().enumerate() {
            if *index as usize != expected {
                return Err(ImportError::structural(format!(
                    "upload {} is missing chunk {} ({} chunks present)",
                    upload_id,
                    expected,
                    chunks.len()
                )));
            }
            let bytes = BASE64.decode(data).map_err(|e| {
                ImportError::structural(format!("chunk {} is not valid base64: {}", index, e))
            })?;
            buffer.extend_from_slice(&bytes);
        }

        self.store
            .delete_many(collections::UPLOAD_CHUNKS, json!({ "uploadId": upload_id }))
            .await?;

        info!(
            "Assembled upload {}: {} chunks, {} bytes",
            upload_id,
            chunks.len(),
            buffer.len()
        );
        Ok(buffer)
    }

    /// Delete chunks older than the TTL. Returns the number removed.
    pub async fn purge_expired(&self, ttl: Duration) -> Result<u64, ImportError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        let docs = self.store.find(collections::UPLOAD_CHUNKS, json!({})).await?;

        let mut removed = 0;
        for doc in docs {
            let created_at = doc
                .get("createdAt")
                .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());
            let expired = match created_at {
                Some(ts) => ts < cutoff,
                // Undated chunks are unreachable garbage.
                None => true,
            };
            if expired {
                let filter = json!({
                    "uploadId": doc.get("uploadId").cloned().unwrap_or_default(),
                    "index": doc.get("index").cloned().unwrap_or_default(),
                });
                removed += self
                    .store
                    .delete_many(collections::UPLOAD_CHUNKS, filter)
                    .await?;
            }
        }

        if removed > 0 {
            info!("Purged {} expired upload chunks", removed);
        }
        Ok(removed)
    }
}
