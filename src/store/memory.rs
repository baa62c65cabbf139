//! In-memory document store.
//!
//! Backs local runs and the test suite. Documents are JSON objects grouped
//! by collection name; upserts merge `set` fields at the top level, which is
//! the same visible behavior the production store's `$set` upserts have.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{matches_filter, BulkResult, DocumentStore, StoreError, UpsertOp};

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_upsert(docs: &mut Vec<Value>, op: &UpsertOp) -> Result<bool, StoreError> {
        let set = op
            .set
            .as_object()
            .ok_or_else(|| StoreError::Backend("upsert set must be a document".into()))?;

        if let Some(doc) = docs.iter_mut().find(|d| matches_filter(d, &op.filter)) {
            let obj = doc
                .as_object_mut()
                .ok_or_else(|| StoreError::Backend("stored document is not an object".into()))?;
            for (k, v) in set {
                obj.insert(k.clone(), v.clone());
            }
            return Ok(false);
        }

        // Insert path: filter fields seed the document so the natural key
        // is queryable, then set_on_insert and set are layered on top.
        let mut doc = op.filter.as_object().cloned().unwrap_or_default();
        if let Some(on_insert) = op.set_on_insert.as_object() {
            for (k, v) in on_insert {
                doc.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in set {
            doc.insert(k.clone(), v.clone());
        }
        docs.push(Value::Object(doc));
        Ok(true)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, collection: &str, filter: Value) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches_filter(d, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Value,
    ) -> Result<Option<Value>, StoreError> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| matches_filter(d, &filter)).cloned()))
    }

    async fn upsert(&self, collection: &str, op: UpsertOp) -> Result<bool, StoreError> {
        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();
        Self::apply_upsert(docs, &op)
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        ops: Vec<UpsertOp>,
    ) -> Result<BulkResult, StoreError> {
        let total = ops.len();
        let mut result = BulkResult::default();
        let mut errors = Vec::new();

        let mut collections = self.collections.write();
        let docs = collections.entry(collection.to_string()).or_default();

        for (i, op) in ops.iter().enumerate() {
            match Self::apply_upsert(docs, op) {
                Ok(true) => result.inserted += 1,
                Ok(false) => result.matched += 1,
                Err(e) => errors.push(format!("op {}: {}", i, e)),
            }
        }

        if errors.is_empty() {
            Ok(result)
        } else {
            Err(StoreError::PartialWrite {
                failed: errors.len(),
                total,
                errors,
            })
        }
    }

    async fn delete_many(&self, collection: &str, filter: Value) -> Result<u64, StoreError> {
        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !matches_filter(d, &filter));
        Ok((before - docs.len()) as u64)
    }

    async fn count(&self, collection: &str, filter: Value) -> Result<u64, StoreError> {
        Ok(self.find(collection, filter).await?.len() as u64)
    }
}
