//! Monthly units report importer.
//!
//! The report carries title rows above its header (handled by the
//! decoder's token scan) and identifies dealers by display name only.
//! Writes new/used unit counts into the period's stats record.

use std::sync::Arc;

use serde_json::json;

use super::{parse_count, DealerIndex, Field, FieldMap, ImportContext, ImportOutcome, ProgressSink};
use crate::decode::DecodedSheet;
use crate::error::ImportError;
use crate::services::bulk;
use crate::store::{collections, DocumentStore, UpsertOp};

const FIELDS: [Field; 3] = [
    Field::required("dealer_name", &["dealer_name", "dealer", "dealership"]),
    Field::optional("new", &["new", "new_units", "new_sold", "new_units_sold"]),
    Field::optional("used", &["used", "used_units", "used_sold", "used_units_sold"]),
];

pub async fn import(
    store: &Arc<dyn DocumentStore>,
    sheets: &[DecodedSheet],
    ctx: &ImportContext,
    sink: &Arc<dyn ProgressSink>,
) -> Result<ImportOutcome, ImportError> {
    let (year, month) = ctx.require_period()?;
    let dealers = DealerIndex::load(store).await?;

    let mut outcome = ImportOutcome::default();
    let mut ops: Vec<UpsertOp> = Vec::new();

    for sheet in sheets {
        let map = FieldMap::resolve(&sheet.headers, &FIELDS)?;

        for (i, row) in sheet.rows.iter().enumerate() {
            outcome.total_rows += 1;
            let name = map.get(row, "dealer_name");
            if name.is_empty() {
                outcome.record_row_error(format!("row {}: missing dealer name", i + 1));
                continue;
            }
            let Some(code) = dealers.match_name(&name) else {
                outcome.record_row_error(format!("row {}: no dealer matches '{}'", i + 1, name));
                continue;
            };

            ops.push(UpsertOp::new(
                json!({ "dealerCode": code, "year": year, "month": month }),
                json!({
                    "newUnitsSold": parse_count(&map.get(row, "new")),
                    "usedUnitsSold": parse_count(&map.get(row, "used")),
                }),
            ));
        }
    }

    let result = bulk::bulk_upsert(
        Arc::clone(store),
        collections::MONTHLY_DEALER_STATS,
        ops,
        &ctx.bulk,
        |done, total| {
            let sink = Arc::clone(sink);
            async move {
                sink.on_progress(done, total, "Importing unit sales").await;
            }
        },
    )
    .await?;

    outcome.imported_count = (result.matched + result.inserted) as u64;
    for _ in 0..result.failed {
        outcome.record_row_error("stats upsert failed at the store".into());
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
            year: Some(2024),
            month: Some(3),
            bulk: Default::default(),
        }
    }

    async fn seed_dealer(store: &Arc<dyn DocumentStore>, code: &str, name: &str) {
        store
            .upsert(
                collections::DEALERS,
                UpsertOp::new(
                    json!({ "code": code }),
                    json!({ "id": uuid::Uuid::new_v4(), "name": name }),
                ),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_units_written_to_period_record() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        seed_dealer(&store, "0042", "First Honda").await;

        let csv = b"Monthly Units Report\n,\nDealer Name,New,Used\nFirst Honda,10,4\n";
        let sheets = decode::decode(csv, FileKind::Units, None).unwrap();
        let sink: Arc<dyn ProgressSink> = Arc::new(NoopSink);
        let outcome = import(&store, &sheets, &ctx(), &sink).await.unwrap();

        assert_eq!(outcome.imported_count, 1);
        let doc = store
            .find_one(
                collections::MONTHLY_DEALER_STATS,
                json!({ "dealerCode": "0042", "year": 2024, "month": 3 }),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["newUnitsSold"], 10);
        assert_eq!(doc["usedUnitsSold"], 4);
    }

    #[tokio::test]
    async fn test_unknown_dealer_is_row_error() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        seed_dealer(&store, "0042", "First Honda").await;

        let csv = b"Dealer Name,New,Used\nFirst Honda,10,4\nGhost Motors,1,1\n";
        let sheets = decode::decode(csv, FileKind::Units, None).unwrap();
        let sink: Arc<dyn ProgressSink> = Arc::new(NoopSink);
        let outcome = import(&store, &sheets, &ctx(), &sink).await.unwrap();

        assert_eq!(outcome.total_rows, 2);
        assert_eq!(outcome.imported_count, 1);
        assert_eq!(outcome.row_error_count, 1);
        assert!(outcome.row_errors[0].contains("Ghost Motors"));
    }

    #[tokio::test]
    async fn test_missing_period_is_structural() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let csv = b"Dealer Name,New,Used\nFirst Honda,10,4\n";
        let sheets = decode::decode(csv, FileKind::Units, None).unwrap();
        let sink: Arc<dyn ProgressSink> = Arc::new(NoopSink);
        let no_period = ImportContext {
            year: None,
            month: None,
            bulk: Default::default(),
        };
        let err = import(&store, &sheets, &no_period, &sink).await.unwrap_err();
        assert!(err.is_structural());
    }
}
