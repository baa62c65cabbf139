//! Dealer master file importer.
//!
//! Upserts dealers by code. Optional contact fields only overwrite when
//! the new row supplies a non-empty value; a dealer without an email gets
//! a synthesized placeholder address on first insert.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{Field, FieldMap, ImportContext, ImportOutcome, ProgressSink};
use crate::decode::DecodedSheet;
use crate::error::ImportError;
use crate::services::bulk;
use crate::store::{collections, DocumentStore, UpsertOp};
use crate::types::DEALER_PLACEHOLDER_DOMAIN;

const FIELDS: [Field; 8] = [
    Field::required("code", &["dealer_code", "code", "dealer_number", "dlr_code"]),
    Field::required("name", &["dealer_name", "name", "dealership"]),
    Field::optional("email", &["email", "email_address", "contact_email"]),
    Field::optional("phone", &["phone", "phone_number", "telephone"]),
    Field::optional("address", &["address", "address_1", "street_address"]),
    Field::optional("city", &["city"]),
    Field::optional("state", &["state", "st"]),
    Field::optional("zip", &["zip", "zip_code", "postal_code"]),
];

const OPTIONAL_CONTACT_FIELDS: [(&str, &str); 6] = [
    ("email", "email"),
    ("phone", "phone"),
    ("address", "address"),
    ("city", "city"),
    ("state", "state"),
    ("zip", "zip"),
];

pub async fn import(
    store: &Arc<dyn DocumentStore>,
    sheets: &[DecodedSheet],
    ctx: &ImportContext,
    sink: &Arc<dyn ProgressSink>,
) -> Result<ImportOutcome, ImportError> {
    let mut outcome = ImportOutcome::default();
    let mut ops: Vec<UpsertOp> = Vec::new();

    for sheet in sheets {
        let map = FieldMap::resolve(&sheet.headers, &FIELDS)?;

        for (i, row) in sheet.rows.iter().enumerate() {
            outcome.total_rows += 1;
            let code = map.get(row, "code");
            if code.is_empty() {
                outcome.record_row_error(format!("row {}: missing dealer code", i + 1));
                continue;
            }
            let name = map.get(row, "name");
            if name.is_empty() {
                outcome.record_row_error(format!("row {}: missing dealer name", i + 1));
                continue;
            }

            let mut set = Map::new();
            set.insert("name".into(), json!(name));
            for (logical, field) in OPTIONAL_CONTACT_FIELDS {
                let value = map.get(row, logical);
                // Empty source cells never blank out known data.
                if !value.is_empty() {
                    set.insert(field.into(), json!(value));
                }
            }

            let mut on_insert = Map::new();
            on_insert.insert("id".into(), json!(Uuid::new_v4()));
            if !set.contains_key("email") {
                on_insert.insert(
                    "email".into(),
                    json!(format!("{}@{}", code, DEALER_PLACEHOLDER_DOMAIN)),
                );
            }

            ops.push(
                UpsertOp::new(json!({ "code": code }), Value::Object(set))
                    .with_set_on_insert(Value::Object(on_insert)),
            );
        }
    }

    let result = bulk::bulk_upsert(
        Arc::clone(store),
        collections::DEALERS,
        ops,
        &ctx.bulk,
        |done, total| {
            let sink = Arc::clone(sink);
            async move {
                sink.on_progress(done, total, "Importing dealers").await;
            }
        },
    )
    .await?;

    outcome.imported_count = (result.matched + result.inserted) as u64;
    for _ in 0..result.failed {
        outcome.record_row_error("dealer upsert failed at the store".into());
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode;
    use crate::importers::NoopSink;
    use crate::store::memory::MemoryStore;
    use crate::types::FileKind;

    fn ctx() -> ImportContext {
        ImportContext {
            year: None,
            month: None,
            bulk: Default::default(),
        }
    }

    fn sink() -> Arc<dyn ProgressSink> {
        Arc::new(NoopSink)
    }

    async fn run(store: &Arc<dyn DocumentStore>, csv: &[u8]) -> Result<ImportOutcome, ImportError> {
        let sheets = decode::decode(csv, FileKind::DealerMaster, None)?;
        import(store, &sheets, &ctx(), &sink()).await
    }

    #[tokio::test]
    async fn test_inserts_with_placeholder_email() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let csv = b"Dealer Code,Dealer Name,Phone\n0042,First Honda,555-0100\n";
        let outcome = run(&store, csv).await.unwrap();
        assert_eq!(outcome.imported_count, 1);

        let doc = store
            .find_one(collections::DEALERS, json!({ "code": "0042" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["name"], "First Honda");
        assert_eq!(doc["email"], "0042@dealers.invalid");
        assert_eq!(doc["phone"], "555-0100");
    }

    #[tokio::test]
    async fn test_empty_cells_do_not_blank_existing_fields() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        run(
            &store,
            b"Dealer Code,Dealer Name,Email,Phone\n0042,First Honda,sales@firsthonda.com,555-0100\n",
        )
        .await
        .unwrap();
        // Second file has the same dealer with blank contact cells.
        run(&store, b"Dealer Code,Dealer Name,Email,Phone\n0042,First Honda,,\n")
            .await
            .unwrap();

        let doc = store
            .find_one(collections::DEALERS, json!({ "code": "0042" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["email"], "sales@firsthonda.com");
        assert_eq!(doc["phone"], "555-0100");
    }

    #[tokio::test]
    async fn test_rows_without_code_recorded_and_skipped() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let csv = b"Dealer Code,Dealer Name\n0042,First Honda\n,No Code Motors\n0043,Acura of Peoria\n";
        let outcome = run(&store, csv).await.unwrap();

        assert_eq!(outcome.total_rows, 3);
        assert_eq!(outcome.imported_count, 2);
        assert_eq!(outcome.row_error_count, 1);
        assert!(outcome.row_errors[0].contains("row 2"));
        assert_eq!(
            store.count(collections::DEALERS, json!({})).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_missing_required_column_aborts_before_writes() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let csv = b"Dealer Name,Phone\nFirst Honda,555-0100\n";
        let err = run(&store, csv).await.unwrap_err();
        assert!(err.is_structural());
        assert_eq!(
            store.count(collections::DEALERS, json!({})).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_reimport_is_idempotent() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let csv = b"Dealer Code,Dealer Name\n0042,First Honda\n0043,Acura of Peoria\n";
        run(&store, csv).await.unwrap();
        run(&store, csv).await.unwrap();
        assert_eq!(
            store.count(collections::DEALERS, json!({})).await.unwrap(),
            2
        );
    }
}
