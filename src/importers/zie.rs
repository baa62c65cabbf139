//! Exterior/interior service report ("ZIE") importer.
//!
//! Headerless fixed-layout export; every row carries its own reporting
//! period. Dealers are matched by normalized name.

use std::sync::Arc;

use serde_json::json;

use super::{parse_amount, parse_count, DealerIndex, ImportContext, ImportOutcome, ProgressSink};
use crate::decode::DecodedSheet;
use crate::error::ImportError;
use crate::services::bulk;
use crate::store::{collections, DocumentStore, UpsertOp};

pub async fn import(
    store: &Arc<dyn DocumentStore>,
    sheets: &[DecodedSheet],
    ctx: &ImportContext,
    sink: &Arc<dyn ProgressSink>,
) -> Result<ImportOutcome, ImportError> {
    let dealers = DealerIndex::load(store).await?;

    let mut outcome = ImportOutcome::default();
    let mut ops: Vec<UpsertOp> = Vec::new();

    for sheet in sheets {
        for (i, row) in sheet.rows.iter().enumerate() {
            outcome.total_rows += 1;

            let name = row.get("dealer_name").map(|v| v.trim()).unwrap_or_default();
            if name.is_empty() {
                outcome.record_row_error(format!("row {}: missing dealer name", i + 1));
                continue;
            }
            let Some(code) = dealers.match_name(name) else {
                outcome.record_row_error(format!("row {}: no dealer matches '{}'", i + 1, name));
                continue;
            };

            let year = row
                .get("year")
                .and_then(|v| v.trim().parse::<i32>().ok());
            let month = row
                .get("month")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|m| (1..=12).contains(m));
            let (Some(year), Some(month)) = (year, month) else {
                outcome.record_row_error(format!("row {}: bad reporting period", i + 1));
                continue;
            };

            ops.push(UpsertOp::new(
                json!({ "dealerCode": code, "year": year, "month": month }),
                json!({
                    "exteriorRepairs": row.get("exterior_repairs").and_then(|v| parse_count(v)),
                    "interiorRepairs": row.get("interior_repairs").and_then(|v| parse_count(v)),
                    "serviceAmount": row.get("service_amount").and_then(|v| parse_amount(v)),
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
                sink.on_progress(done, total, "Importing service repairs").await;
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
