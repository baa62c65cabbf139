//! Monthly billing report importer.
//!
//! Pipe-delimited export. Unlike the other stats sources the dealer name
//! string embeds the dealer code in a parenthesized suffix, e.g.
//! "Acura of Peoria (666)", so resolution is by derived code rather than
//! by name matching.

use std::sync::Arc;

use regex::Regex;
use serde_json::json;

use super::{parse_amount, parse_count, DealerIndex, Field, FieldMap, ImportContext, ImportOutcome, ProgressSink};
use crate::decode::DecodedSheet;
use crate::error::ImportError;
use crate::services::bulk;
use crate::store::{collections, DocumentStore, UpsertOp};

const FIELDS: [Field; 3] = [
    Field::required("dealer_name", &["dealer_name", "dealer"]),
    Field::optional("contracts", &["billed_contracts", "contracts", "contract_count"]),
    Field::optional("amount", &["billed_amount", "amount", "total_amount"]),
];

/// Pull the dealer code out of a trailing parenthesized number,
/// zero-padded to the canonical 4 digits.
pub fn code_from_name(name: &str) -> Option<String> {
    let re = Regex::new(r"\((\d+)\)\s*$").expect("static regex");
    let digits = re.captures(name.trim())?.get(1)?.as_str().to_string();
    if digits.len() >= 4 {
        Some(digits)
    } else {
        Some(format!("{:0>4}", digits))
    }
}

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
            let Some(code) = code_from_name(&name) else {
                outcome.record_row_error(format!(
                    "row {}: no dealer code suffix in '{}'",
                    i + 1,
                    name
                ));
                continue;
            };
            if !dealers.has_code(&code) {
                outcome.record_row_error(format!(
                    "row {}: dealer code '{}' not found",
                    i + 1,
                    code
                ));
                continue;
            }

            ops.push(UpsertOp::new(
                json!({ "dealerCode": code, "year": year, "month": month }),
                json!({
                    "billedContracts": parse_count(&map.get(row, "contracts")),
                    "billedAmount": parse_amount(&map.get(row, "amount")),
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
                sink.on_progress(done, total, "Importing billing").await;
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
