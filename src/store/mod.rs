//! Generic document-store seam.
//!
//! The worker treats persistence as an external collaborator: everything it
//! needs is expressed by the [`DocumentStore`] trait (equality-filtered find,
//! upsert-with-set, unordered bulk upsert, delete, count) against named
//! collections. Production wires its own implementation at process startup
//! and injects the handle into every component; [`memory::MemoryStore`]
//! backs local runs and the test suite.

pub mod jobs;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Collection names used by the pipeline.
pub mod collections {
    pub const IMPORT_JOBS: &str = "import_jobs";
    pub const UPLOAD_CHUNKS: &str = "upload_chunks";
    pub const DEALERS: &str = "dealers";
    pub const CUSTOMERS: &str = "customers";
    pub const CONTRACTS: &str = "contracts";
    pub const MONTHLY_DEALER_STATS: &str = "monthly_dealer_stats";
}

/// One upsert keyed by an equality filter.
///
/// `set` fields are merged into the matched document (or the new one);
/// fields absent from `set` are never blanked out. `set_on_insert` fields
/// are applied only when the filter matched nothing.
#[derive(Debug, Clone)]
pub struct UpsertOp {
    pub filter: Value,
    pub set: Value,
    pub set_on_insert: Value,
}

impl UpsertOp {
    pub fn new(filter: Value, set: Value) -> Self {
        Self {
            filter,
            set,
            set_on_insert: Value::Null,
        }
    }

    pub fn with_set_on_insert(mut self, on_insert: Value) -> Self {
        self.set_on_insert = on_insert;
        self
    }
}

/// Outcome of a bulk upsert that completed without a batch-level failure.
#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    pub matched: usize,
    pub inserted: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Some operations in a bulk write failed while the rest were applied.
    /// Bulk writes are unordered, so this is recoverable by the caller.
    #[error("partial bulk write: {failed} of {total} operations failed")]
    PartialWrite {
        failed: usize,
        total: usize,
        errors: Vec<String>,
    },

    /// Anything else from the backend (connectivity, serialization, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// The document database as the pipeline sees it.
///
/// Filters are JSON objects matched by top-level field equality; that is
/// all the import path ever needs.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, collection: &str, filter: Value) -> Result<Vec<Value>, StoreError>;

    async fn find_one(&self, collection: &str, filter: Value)
        -> Result<Option<Value>, StoreError>;

    /// Upsert a single document. Returns true when a new document was
    /// inserted rather than an existing one updated.
    async fn upsert(&self, collection: &str, op: UpsertOp) -> Result<bool, StoreError>;

    /// Apply all operations independently (unordered). A mix of successes
    /// and per-op failures surfaces as [`StoreError::PartialWrite`].
    async fn bulk_upsert(
        &self,
        collection: &str,
        ops: Vec<UpsertOp>,
    ) -> Result<BulkResult, StoreError>;

    async fn delete_many(&self, collection: &str, filter: Value) -> Result<u64, StoreError>;

    async fn count(&self, collection: &str, filter: Value) -> Result<u64, StoreError>;
}

/// True when every field of `filter` equals the corresponding field of `doc`.
pub(crate) fn matches_filter(doc: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| doc.get(k) == Some(v)),
        None => filter.is_null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matches_filter_equality() {
        let doc = json!({"code": "0666", "name": "Acura of Peoria"});
        assert!(matches_filter(&doc, &json!({"code": "0666"})));
        assert!(!matches_filter(&doc, &json!({"code": "0667"})));
        assert!(matches_filter(&doc, &json!({})));
    }

    #[test]
    fn test_matches_filter_multiple_fields() {
        let doc = json!({"dealerCode": "0666", "year": 2024, "month": 3});
        assert!(matches_filter(&doc, &json!({"dealerCode": "0666", "year": 2024, "month": 3})));
        assert!(!matches_filter(&doc, &json!({"dealerCode": "0666", "year": 2024, "month": 4})));
    }
}
