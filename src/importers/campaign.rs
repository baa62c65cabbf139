//! Campaign results importer.
//!
//! The source is a workbook with one sheet per reporting month; the
//! decoder has already parsed each tab name into a (year, month) tag and
//! dropped sheets without one. Dealers are matched by normalized name.

use std::sync::Arc;

use serde_json::json;

use super::{parse_count, DealerIndex, Field, FieldMap, ImportContext, ImportOutcome, ProgressSink};
use crate::decode::DecodedSheet;
use crate::error::ImportError;
use crate::services::bulk;
use crate::store::{collections, DocumentStore, UpsertOp};

const FIELDS: [Field; 3] = [
    Field::required("dealer_name", &["dealer_name", "dealer", "dealership"]),
    Field::optional("mailed", &["mailed", "pieces_mailed", "campaign_mailed", "quantity_mailed"]),
    Field::optional("responses", &["responses", "response_count", "campaign_responses", "replies"]),
];

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
        // Single-sheet text inputs fall back to the upload-time period.
        let period = match (sheet.year.or(ctx.year), sheet.month.or(ctx.month)) {
            (Some(year), Some(month)) => (year, month),
            _ => {
                return Err(ImportError::structural(format!(
                    "no reporting period for sheet '{}'",
                    sheet.name.as_deref().unwrap_or("?")
                )))
            }
        };

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
                json!({ "dealerCode": code, "year": period.0, "month": period.1 }),
                json!({
                    "campaignMailed": parse_count(&map.get(row, "mailed")),
                    "campaignResponses": parse_count(&map.get(row, "responses")),
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
                sink.on_progress(done, total, "Importing campaign results").await;
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
