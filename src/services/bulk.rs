//! Bulk Upsert Engine
//!
//! Every importer funnels its writes through this one wrapper so they all
//! share the same batching, bounded parallelism, and partial-failure
//! semantics. Operations are partitioned into fixed-size batches, batches
//! run in waves of `parallelism`, and each batch write is raced against a
//! deadline. A timed-out or partially-failed batch is logged and counted,
//! never propagated; anything else aborts the run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::store::{DocumentStore, StoreError, UpsertOp};

#[derive(Debug, Clone)]
pub struct BulkConfig {
    pub batch_size: usize,
    pub parallelism: usize,
    pub per_batch_timeout: Duration,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            parallelism: 4,
            per_batch_timeout: Duration::from_secs(30),
        }
    }
}

/// Totals across all batches of one run.
#[derive(Debug, Clone, Default)]
pub struct BulkOutcome {
    pub attempted: usize,
    pub failed: usize,
    pub matched: usize,
    pub inserted: usize,
}

/// Result of one batch write, after timeout and partial-write containment.
enum BatchStatus {
    Done { matched: usize, inserted: usize },
    PartialFailure { failed: usize },
    TimedOut { size: usize },
    Fatal(StoreError),
}

/// Apply all operations against one collection.
///
/// `on_wave_complete(done, total)` fires after every wave so the caller
/// can persist and report incremental progress.
pub async fn bulk_upsert<F, Fut>(
    store: Arc<dyn DocumentStore>,
    collection: &str,
    ops: Vec<UpsertOp>,
    config: &BulkConfig,
    mut on_wave_complete: F,
) -> Result<BulkOutcome, StoreError>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = ()>,
{
    let total = ops.len();
    let mut outcome = BulkOutcome::default();
    if total == 0 {
        return Ok(outcome);
    }

    let batch_size = config.batch_size.max(1);
    let parallelism = config.parallelism.max(1);
    let batches: Vec<Vec<UpsertOp>> = ops
        .chunks(batch_size)
        .map(|batch| batch.to_vec())
        .collect();
    debug!(
        "Bulk upsert into '{}': {} ops in {} batches ({} per wave)",
        collection,
        total,
        batches.len(),
        parallelism
    );

    for wave in batches.chunks(parallelism) {
        let futures = wave.iter().map(|batch| {
            let store = Arc::clone(&store);
            let batch = batch.clone();
            let deadline = config.per_batch_timeout;
            async move {
                let size = batch.len();
                match timeout(deadline, store.bulk_upsert(collection, batch)).await {
                    Ok(Ok(result)) => BatchStatus::Done {
                        matched: result.matched,
                        inserted: result.inserted,
                    },
                    Ok(Err(StoreError::PartialWrite { failed, total, errors })) => {
                        warn!(
                            "Partial bulk write: {}/{} ops failed (first: {})",
                            failed,
                            total,
                            errors.first().map(String::as_str).unwrap_or("?")
                        );
                        BatchStatus::PartialFailure { failed }
                    }
                    Ok(Err(e)) => BatchStatus::Fatal(e),
                    Err(_) => BatchStatus::TimedOut { size },
                }
            }
        });

        let wave_sizes: usize = wave.iter().map(Vec::len).sum();
        let statuses = futures::future::join_all(futures).await;

        let mut fatal = None;
        for status in statuses {
            match status {
                BatchStatus::Done { matched, inserted } => {
                    outcome.matched += matched;
                    outcome.inserted += inserted;
                }
                BatchStatus::PartialFailure { failed } => {
                    outcome.failed += failed;
                }
                BatchStatus::TimedOut { size } => {
                    warn!(
                        "Batch of {} ops against '{}' timed out after {:?}; counting as failed",
                        size, collection, config.per_batch_timeout
                    );
                    outcome.failed += size;
                }
                BatchStatus::Fatal(e) => fatal = Some(e),
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        outcome.attempted += wave_sizes;
        on_wave_complete(outcome.attempted, total).await;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::BulkResult;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    fn op(code: usize) -> UpsertOp {
        UpsertOp::new(json!({ "code": code.to_string() }), json!({ "seen": true }))
    }

    fn bad_op(code: usize) -> UpsertOp {
        // Non-object set values are rejected per operation by the store.
        UpsertOp::new(json!({ "code": code.to_string() }), Value::Null)
    }

    #[tokio::test]
    async fn test_all_ops_applied_and_progress_reported() {
        let store = Arc::new(MemoryStore::new());
        let config = BulkConfig {
            batch_size: 10,
            parallelism: 2,
            ..Default::default()
        };
        let waves = Arc::new(Mutex::new(Vec::new()));

        let waves_cb = Arc::clone(&waves);
        let outcome = bulk_upsert(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            "dealers",
            (0..45).map(op).collect(),
            &config,
            move |done, total| {
                let waves = Arc::clone(&waves_cb);
                async move {
                    waves.lock().push((done, total));
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempted, 45);
        assert_eq!(outcome.inserted, 45);
        assert_eq!(outcome.failed, 0);
        assert_eq!(store.count("dealers", json!({})).await.unwrap(), 45);
        // 5 batches in waves of 2 -> 3 callbacks, cumulative and ending at total.
        assert_eq!(*waves.lock(), vec![(20, 45), (40, 45), (45, 45)]);
    }

    #[tokio::test]
    async fn test_partial_failures_contained() {
        let store = Arc::new(MemoryStore::new());
        let config = BulkConfig {
            batch_size: 10,
            parallelism: 4,
            ..Default::default()
        };

        // 90 good ops and 10 bad ones spread across batches.
        let ops: Vec<UpsertOp> = (0..100)
            .map(|i| if i % 10 == 3 { bad_op(i) } else { op(i) })
            .collect();

        let outcome = bulk_upsert(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            "dealers",
            ops,
            &config,
            |_, _| async {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempted, 100);
        assert_eq!(outcome.failed, 10);
        assert_eq!(store.count("dealers", json!({})).await.unwrap(), 90);
    }

    struct StuckStore;

    #[async_trait]
    impl DocumentStore for StuckStore {
        async fn find(&self, _: &str, _: Value) -> Result<Vec<Value>, StoreError> {
            Ok(Vec::new())
        }
        async fn find_one(&self, _: &str, _: Value) -> Result<Option<Value>, StoreError> {
            Ok(None)
        }
        async fn upsert(&self, _: &str, _: UpsertOp) -> Result<bool, StoreError> {
            Ok(true)
        }
        async fn bulk_upsert(&self, _: &str, _: Vec<UpsertOp>) -> Result<BulkResult, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(BulkResult::default())
        }
        async fn delete_many(&self, _: &str, _: Value) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn count(&self, _: &str, _: Value) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_batches_counted_not_propagated() {
        let config = BulkConfig {
            batch_size: 5,
            parallelism: 2,
            per_batch_timeout: Duration::from_millis(100),
        };

        let outcome = bulk_upsert(
            Arc::new(StuckStore) as Arc<dyn DocumentStore>,
            "dealers",
            (0..10).map(op).collect(),
            &config,
            |_, _| async {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.attempted, 10);
        assert_eq!(outcome.failed, 10);
        assert_eq!(outcome.inserted, 0);
    }

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn find(&self, _: &str, _: Value) -> Result<Vec<Value>, StoreError> {
            Ok(Vec::new())
        }
        async fn find_one(&self, _: &str, _: Value) -> Result<Option<Value>, StoreError> {
            Ok(None)
        }
        async fn upsert(&self, _: &str, _: UpsertOp) -> Result<bool, StoreError> {
            Ok(true)
        }
        async fn bulk_upsert(&self, _: &str, _: Vec<UpsertOp>) -> Result<BulkResult, StoreError> {
            Err(StoreError::Backend("connection reset".into()))
        }
        async fn delete_many(&self, _: &str, _: Value) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn count(&self, _: &str, _: Value) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_backend_errors_propagate() {
        let result = bulk_upsert(
            Arc::new(BrokenStore) as Arc<dyn DocumentStore>,
            "dealers",
            (0..10).map(op).collect(),
            &BulkConfig::default(),
            |_, _| async {},
        )
        .await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }
}
