//! Contracts file importer.
//!
//! The largest source file, split into three independently invoked phases
//! (dealers, customers, contracts) so each stays within a bounded run
//! time. Every phase re-resolves its columns and rebuilds its lookup
//! state from the store; nothing in memory survives between phases.
//! Contract status is derived at import time, never copied from the file.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{
    is_sentinel_date, parse_date, Field, FieldMap, ImportContext, ImportOutcome, ProgressSink,
};
use crate::decode::DecodedSheet;
use crate::error::ImportError;
use crate::services::bulk;
use crate::store::{collections, DocumentStore, UpsertOp};
use crate::types::{ContractStatus, CoveragePlan, CUSTOMER_PLACEHOLDER_DOMAIN, DEALER_PLACEHOLDER_DOMAIN};

/// More distinct dealer codes than this means the file is mis-mapped
/// (wrong delimiter or column offset), not that the network grew tenfold.
const MAX_DEALER_CODES: usize = 2000;

const FIELDS: [Field; 16] = [
    Field::required("dealer_code", &["dealer_code", "dealer_number", "dlr_code", "dealer"]),
    Field::required("agreement", &["agreement", "agreement_number", "agreement_no", "contract_number"]),
    Field::optional("agreement_suffix", &["agreement_suffix", "suffix", "agr_suffix"]),
    Field::optional("dealer_name", &["dealer_name", "dealership"]),
    Field::optional("email", &["customer_email", "email", "e_mail"]),
    Field::optional("first_name", &["first_name", "customer_first_name", "fname"]),
    Field::optional("last_name", &["last_name", "customer_last_name", "lname"]),
    Field::optional("phone", &["phone", "phone_number", "customer_phone"]),
    Field::optional("address", &["address", "address_1", "street_address"]),
    Field::optional("city", &["city"]),
    Field::optional("state", &["state", "st"]),
    Field::optional("zip", &["zip", "zip_code", "postal_code"]),
    Field::optional("coverage", &["coverage", "coverage_code", "plan", "plan_code"]),
    Field::optional("purchase_date", &["purchase_date", "sale_date", "contract_date"]),
    Field::optional("expiration_date", &["expiration_date", "expire_date", "exp_date"]),
    Field::optional("cancel_date", &["cancel_post_date", "cancellation_post_date", "cancel_date"]),
];

const EXTRA_FIELDS: [Field; 1] = [Field::optional("vin", &["vin", "vin_number", "serial_number"])];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractPhase {
    Dealers,
    Customers,
    Contracts,
}

impl ContractPhase {
    /// Execution order is fixed: contract upserts resolve foreign keys the
    /// earlier phases must have written.
    pub const ALL: [ContractPhase; 3] = [
        ContractPhase::Dealers,
        ContractPhase::Customers,
        ContractPhase::Contracts,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ContractPhase::Dealers => "dealers",
            ContractPhase::Customers => "customers",
            ContractPhase::Contracts => "contracts",
        }
    }
}

/// Derive the stored contract status.
///
/// Cancelled wins when a real (non-sentinel) cancellation post date is
/// present, even with a future expiration. Expiration uses strict `<`:
/// a contract expiring today is still active.
pub fn derive_status(
    cancellation: Option<NaiveDate>,
    expiration: Option<NaiveDate>,
    today: NaiveDate,
) -> ContractStatus {
    if cancellation.is_some() {
        return ContractStatus::Cancelled;
    }
    match expiration {
        Some(exp) if exp < today => ContractStatus::Expired,
        _ => ContractStatus::Active,
    }
}

fn resolve_columns(sheet: &DecodedSheet) -> Result<FieldMap, ImportError> {
    let mut fields: Vec<Field> = Vec::with_capacity(FIELDS.len() + EXTRA_FIELDS.len());
    fields.extend(FIELDS);
    fields.extend(EXTRA_FIELDS);
    FieldMap::resolve(&sheet.headers, &fields)
}

/// Structural sanity check shared by all phases, run before any writes.
fn check_cardinality(sheet: &DecodedSheet, map: &FieldMap) -> Result<(), ImportError> {
    let distinct: HashSet<String> = sheet
        .rows
        .iter()
        .map(|row| map.get(row, "dealer_code"))
        .filter(|code| !code.is_empty())
        .collect();
    if distinct.len() > MAX_DEALER_CODES {
        return Err(ImportError::structural(format!(
            "{} distinct dealer codes in one file (ceiling {}); column mapping looks wrong",
            distinct.len(),
            MAX_DEALER_CODES
        )));
    }
    Ok(())
}

/// The synthesized customer key when the source row carries no email.
fn customer_email(map: &FieldMap, row: &crate::decode::Row) -> String {
    let email = map.get(row, "email");
    if !email.is_empty() {
        return email.to_lowercase();
    }
    let agreement = map.get(row, "agreement");
    let suffix = map.get(row, "agreement_suffix");
    format!("{}-{}@{}", agreement, suffix, CUSTOMER_PLACEHOLDER_DOMAIN)
}

pub async fn import_phase(
    store: &Arc<dyn DocumentStore>,
    sheets: &[DecodedSheet],
    phase: ContractPhase,
    ctx: &ImportContext,
    sink: &Arc<dyn ProgressSink>,
) -> Result<ImportOutcome, ImportError> {
    let Some(sheet) = sheets.first() else {
        return Err(ImportError::structural("contracts file decoded to no sheets"));
    };
    let map = resolve_columns(sheet)?;
    check_cardinality(sheet, &map)?;

    match phase {
        ContractPhase::Dealers => phase_dealers(store, sheet, &map, ctx, sink).await,
        ContractPhase::Customers => phase_customers(store, sheet, &map, ctx, sink).await,
        ContractPhase::Contracts => phase_contracts(store, sheet, &map, ctx, sink).await,
    }
}

async fn phase_dealers(
    store: &Arc<dyn DocumentStore>,
    sheet: &DecodedSheet,
    map: &FieldMap,
    ctx: &ImportContext,
    sink: &Arc<dyn ProgressSink>,
) -> Result<ImportOutcome, ImportError> {
    let mut outcome = ImportOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut ops: Vec<UpsertOp> = Vec::new();

    for row in &sheet.rows {
        outcome.total_rows += 1;
        let code = map.get(row, "dealer_code");
        if code.is_empty() || !seen.insert(code.clone()) {
            continue;
        }

        let name = map.get(row, "dealer_name");
        let mut set = Map::new();
        if !name.is_empty() {
            set.insert("name".into(), json!(name));
        }
        let mut on_insert = Map::new();
        on_insert.insert("id".into(), json!(Uuid::new_v4()));
        on_insert.insert(
            "email".into(),
            json!(format!("{}@{}", code, DEALER_PLACEHOLDER_DOMAIN)),
        );
        if name.is_empty() {
            // A code-only dealer still needs a display name.
            on_insert.insert("name".into(), json!(code.clone()));
        }

        ops.push(
            UpsertOp::new(json!({ "code": code }), Value::Object(set))
                .with_set_on_insert(Value::Object(on_insert)),
        );
    }

    let result = run_bulk(store, collections::DEALERS, ops, ctx, sink, "Importing contract dealers").await?;
    outcome.imported_count = (result.matched + result.inserted) as u64;
    for _ in 0..result.failed {
        outcome.record_row_error("dealer upsert failed at the store".into());
    }
    Ok(outcome)
}

async fn phase_customers(
    store: &Arc<dyn DocumentStore>,
    sheet: &DecodedSheet,
    map: &FieldMap,
    ctx: &ImportContext,
    sink: &Arc<dyn ProgressSink>,
) -> Result<ImportOutcome, ImportError> {
    let mut outcome = ImportOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut ops: Vec<UpsertOp> = Vec::new();

    for (i, row) in sheet.rows.iter().enumerate() {
        outcome.total_rows += 1;
        if map.get(row, "agreement").is_empty() && map.get(row, "email").is_empty() {
            outcome.record_row_error(format!("row {}: no agreement or customer email", i + 1));
            continue;
        }
        let email = customer_email(map, row);
        if !seen.insert(email.clone()) {
            continue;
        }

        let mut set = Map::new();
        for logical in ["first_name", "last_name", "phone", "address", "city", "state", "zip"] {
            let value = map.get(row, logical);
            // Blank cells never erase previously entered contact data.
            if !value.is_empty() {
                set.insert(snake_to_camel(logical), json!(value));
            }
        }

        ops.push(
            UpsertOp::new(json!({ "email": email }), Value::Object(set))
                .with_set_on_insert(json!({ "id": Uuid::new_v4() })),
        );
    }

    let result = run_bulk(store, collections::CUSTOMERS, ops, ctx, sink, "Importing customers").await?;
    outcome.imported_count = (result.matched + result.inserted) as u64;
    for _ in 0..result.failed {
        outcome.record_row_error("customer upsert failed at the store".into());
    }
    Ok(outcome)
}

async fn phase_contracts(
    store: &Arc<dyn DocumentStore>,
    sheet: &DecodedSheet,
    map: &FieldMap,
    ctx: &ImportContext,
    sink: &Arc<dyn ProgressSink>,
) -> Result<ImportOutcome, ImportError> {
    let mut outcome = ImportOutcome::default();

    // Foreign keys come from the store, never from earlier in-memory state.
    let dealer_ids = load_key_map(store, collections::DEALERS, "code").await?;
    let customer_ids = load_key_map(store, collections::CUSTOMERS, "email").await?;
    let today = chrono::Utc::now().date_naive();

    let mut ops: Vec<UpsertOp> = Vec::new();
    for (i, row) in sheet.rows.iter().enumerate() {
        outcome.total_rows += 1;

        let code = map.get(row, "dealer_code");
        let agreement = map.get(row, "agreement");
        if code.is_empty() || agreement.is_empty() {
            outcome.record_row_error(format!("row {}: missing dealer code or agreement", i + 1));
            continue;
        }
        let Some(dealer_id) = dealer_ids.get(&code) else {
            outcome.record_row_error(format!("row {}: dealer code '{}' not found", i + 1, code));
            continue;
        };
        let email = customer_email(map, row);
        let Some(customer_id) = customer_ids.get(&email) else {
            outcome.record_row_error(format!("row {}: customer '{}' not found", i + 1, email));
            continue;
        };

        let agreement_key = format!("{}-{}", agreement, map.get(row, "agreement_suffix"));
        let purchase = parse_date(&map.get(row, "purchase_date"));
        let expiration = parse_date(&map.get(row, "expiration_date"));
        let cancel_raw = map.get(row, "cancel_date");
        let cancellation = if is_sentinel_date(&cancel_raw) {
            None
        } else {
            parse_date(&cancel_raw)
        };
        let status = derive_status(cancellation, expiration, today);
        let plan = CoveragePlan::from_code(&map.get(row, "coverage"));

        let mut set = Map::new();
        set.insert("dealerId".into(), dealer_id.clone());
        set.insert("customerId".into(), customer_id.clone());
        set.insert("plan".into(), json!(plan));
        set.insert("status".into(), json!(status));
        set.insert("purchaseDate".into(), json!(purchase));
        set.insert("expirationDate".into(), json!(expiration));
        set.insert("cancellationPostDate".into(), json!(cancellation));
        let vin = map.get(row, "vin");
        if !vin.is_empty() {
            set.insert("vin".into(), json!(vin));
        }

        ops.push(
            UpsertOp::new(json!({ "agreementKey": agreement_key }), Value::Object(set))
                .with_set_on_insert(json!({ "id": Uuid::new_v4() })),
        );
    }

    let result = run_bulk(store, collections::CONTRACTS, ops, ctx, sink, "Importing contracts").await?;
    outcome.imported_count = (result.matched + result.inserted) as u64;
    for _ in 0..result.failed {
        outcome.record_row_error("contract upsert failed at the store".into());
    }
    Ok(outcome)
}

async fn run_bulk(
    store: &Arc<dyn DocumentStore>,
    collection: &str,
    ops: Vec<UpsertOp>,
    ctx: &ImportContext,
    sink: &Arc<dyn ProgressSink>,
    message: &'static str,
) -> Result<bulk::BulkOutcome, ImportError> {
    let result = bulk::bulk_upsert(Arc::clone(store), collection, ops, &ctx.bulk, |done, total| {
        let sink = Arc::clone(sink);
        async move {
            sink.on_progress(done, total, message).await;
        }
    })
    .await?;
    Ok(result)
}

/// Natural-key to document-id map for one collection.
async fn load_key_map(
    store: &Arc<dyn DocumentStore>,
    collection: &str,
    key_field: &str,
) -> Result<HashMap<String, Value>, ImportError> {
    let docs = store.find(collection, json!({})).await?;
    let mut ids = HashMap::with_capacity(docs.len());
    for doc in docs {
        if let (Some(key), Some(id)) = (
            doc.get(key_field).and_then(|v| v.as_str()),
            doc.get("id").cloned(),
        ) {
            ids.insert(key.to_string(), id);
        }
    }
    Ok(ids)
}

fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}
