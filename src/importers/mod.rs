//! Per-source importers.
//!
//! One module per known source file type. All share the same contract:
//! `import(store, sheets, ctx, sink)` turns decoded rows into natural-key
//! upserts through the bulk engine and returns an [`ImportOutcome`]. A bad
//! row is recorded and skipped; only structural problems (missing required
//! columns, implausible mappings) abort the file.

pub mod billing;
pub mod campaign;
pub mod contracts;
pub mod dealer_master;
pub mod units;
pub mod zie;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde_json::json;

use crate::decode::Row;
use crate::error::ImportError;
use crate::services::bulk::BulkConfig;
use crate::store::{collections, DocumentStore, StoreError};
use crate::types::ROW_ERROR_CAP;

/// Result of one importer pass (or one phase of a multi-phase import).
#[derive(Debug, Clone, Default)]
pub struct ImportOutcome {
    pub total_rows: u64,
    pub imported_count: u64,
    /// Capped row-level error messages; the count keeps growing past it.
    pub row_errors: Vec<String>,
    pub row_error_count: u64,
}

impl ImportOutcome {
    pub fn record_row_error(&mut self, message: String) {
        if self.row_errors.len() < ROW_ERROR_CAP {
            self.row_errors.push(message);
        }
        self.row_error_count += 1;
    }
}

/// Everything an importer needs besides the rows themselves.
#[derive(Debug, Clone)]
pub struct ImportContext {
    /// Reporting period supplied at upload time, for sources whose rows
    /// don't carry their own.
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub bulk: BulkConfig,
}

impl ImportContext {
    /// Period-scoped sources fail structurally without a period.
    pub fn require_period(&self) -> Result<(i32, u32), ImportError> {
        match (self.year, self.month) {
            (Some(year), Some(month)) => Ok((year, month)),
            _ => Err(ImportError::structural(
                "this file type needs a reporting year and month at upload time",
            )),
        }
    }
}

/// Receives incremental progress while an importer's bulk writes run.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, done: usize, total: usize, message: &str);
}

/// Sink for tests and fire-and-forget runs.
pub struct NoopSink;

#[async_trait]
impl ProgressSink for NoopSink {
    async fn on_progress(&self, _done: usize, _total: usize, _message: &str) {}
}

// ==========================================================================
// Alias-schema field resolution
// ==========================================================================

/// One logical field with its accepted header spellings, in preference
/// order. Aliases are written in the decoder's normalized snake_case form.
pub struct Field {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
}

impl Field {
    pub const fn required(name: &'static str, aliases: &'static [&'static str]) -> Self {
        Self {
            name,
            aliases,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, aliases: &'static [&'static str]) -> Self {
        Self {
            name,
            aliases,
            required: false,
        }
    }
}

/// Logical-field-to-header mapping, resolved once per file against the
/// decoded header set instead of probing spellings on every row access.
#[derive(Debug)]
pub struct FieldMap {
    resolved: HashMap<&'static str, String>,
}

impl FieldMap {
    /// Resolve every field against the headers. Missing required fields
    /// are a structural error naming all of them at once.
    pub fn resolve(headers: &[String], fields: &[Field]) -> Result<Self, ImportError> {
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();

        for field in fields {
            match field.aliases.iter().find(|a| headers.iter().any(|h| h == *a)) {
                Some(alias) => {
                    resolved.insert(field.name, alias.to_string());
                }
                None if field.required => missing.push(field.name),
                None => {}
            }
        }

        if !missing.is_empty() {
            return Err(ImportError::structural(format!(
                "required columns not found: {}",
                missing.join(", ")
            )));
        }
        Ok(Self { resolved })
    }

    /// Trimmed cell value for a logical field, empty when the field or
    /// cell is absent.
    pub fn get(&self, row: &Row, name: &str) -> String {
        self.resolved
            .get(name)
            .and_then(|header| row.get(header))
            .map(|value| value.trim().to_string())
            .unwrap_or_default()
    }
}

// ==========================================================================
// Dealer resolution
// ==========================================================================

/// Lowercase and strip everything non-alphanumeric, so "First Honda, Inc."
/// and "FIRST HONDA INC" compare equal.
pub fn normalize_dealer_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Known dealers, loaded once per import pass for name/code resolution.
pub struct DealerIndex {
    /// (normalized name, code) in store order.
    names: Vec<(String, String)>,
    codes: HashMap<String, String>,
}

impl DealerIndex {
    pub async fn load(store: &Arc<dyn DocumentStore>) -> Result<Self, StoreError> {
        let docs = store.find(collections::DEALERS, json!({})).await?;
        let mut names = Vec::with_capacity(docs.len());
        let mut codes = HashMap::with_capacity(docs.len());

        for doc in docs {
            let code = doc.get("code").and_then(|v| v.as_str()).unwrap_or_default();
            let name = doc.get("name").and_then(|v| v.as_str()).unwrap_or_default();
            if code.is_empty() {
                continue;
            }
            names.push((normalize_dealer_name(name), code.to_string()));
            codes.insert(code.to_string(), name.to_string());
        }
        Ok(Self { names, codes })
    }

    /// Resolve a source dealer name to a dealer code: exact normalized
    /// match first, then containment either way. Ambiguous containment
    /// takes the first match found; there is no tie-break rule.
    pub fn match_name(&self, raw: &str) -> Option<&str> {
        let needle = normalize_dealer_name(raw);
        if needle.is_empty() {
            return None;
        }
        if let Some((_, code)) = self.names.iter().find(|(name, _)| *name == needle) {
            return Some(code);
        }
        self.names
            .iter()
            .find(|(name, _)| !name.is_empty() && (name.contains(&needle) || needle.contains(name)))
            .map(|(_, code)| code.as_str())
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.codes.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ==========================================================================
// Cell parsing
// ==========================================================================

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%d-%b-%Y"];

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    // chrono's %Y happily eats two-digit years as year 24, so a format
    // only matches when it yields a plausible calendar year; "03/15/24"
    // then falls through to %m/%d/%y and parses as 2024.
    DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(raw, fmt)
            .ok()
            .filter(|d| d.year() >= 1000)
    })
}

/// "No cancellation date" sentinels produced by the upstream systems:
/// blank, a bare dash, or a zero date (spreadsheet serial 0 / epoch zero).
pub fn is_sentinel_date(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" {
        return true;
    }
    matches!(
        parse_date(raw),
        Some(d) if d == NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or_default()
            || d == NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
    )
}

/// Integer cell; tolerates thousands separators and a trailing ".0".
pub fn parse_count(raw: &str) -> Option<i64> {
    let cleaned: String = raw.chars().filter(|c| !matches!(c, ',' | ' ')).collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned
        .parse::<i64>()
        .ok()
        .or_else(|| cleaned.parse::<f64>().ok().map(|f| f as i64))
}

/// Money cell; tolerates "$", thousands separators, and parentheses
/// negatives.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let negative = raw.starts_with('(') && raw.ends_with(')');
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    let value = cleaned.parse::<f64>().ok()?;
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_map_resolves_first_alias_present() {
        let headers: Vec<String> = ["dlr_code", "dealer_name"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let fields = [
            Field::required("code", &["dealer_code", "dlr_code", "code"]),
            Field::required("name", &["dealer_name", "name"]),
            Field::optional("email", &["email", "email_address"]),
        ];
        let map = FieldMap::resolve(&headers, &fields).unwrap();

        let mut row = Row::new();
        row.insert("dlr_code".into(), " 0042 ".into());
        row.insert("dealer_name".into(), "First Honda".into());
        assert_eq!(map.get(&row, "code"), "0042");
        assert_eq!(map.get(&row, "email"), "");
    }

    #[test]
    fn test_field_map_missing_required_is_structural() {
        let headers: Vec<String> = vec!["something_else".into()];
        let fields = [
            Field::required("code", &["dealer_code"]),
            Field::required("name", &["dealer_name"]),
        ];
        let err = FieldMap::resolve(&headers, &fields).unwrap_err();
        assert!(err.is_structural());
        assert!(err.to_string().contains("code"));
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_normalize_dealer_name() {
        assert_eq!(
            normalize_dealer_name("First Honda, Inc."),
            "firsthondainc"
        );
        assert_eq!(
            normalize_dealer_name("FIRST HONDA INC"),
            "firsthondainc"
        );
        assert_eq!(normalize_dealer_name("Acura of Peoria (666)"), "acuraofpeoria666");
    }

    #[test]
    fn test_dealer_index_exact_then_containment() {
        let index = DealerIndex {
            names: vec![
                ("firsthonda".into(), "0042".into()),
                ("firsthondaofpeoria".into(), "0043".into()),
            ],
            codes: HashMap::new(),
        };
        // Exact beats containment even though 0043 also contains the needle.
        assert_eq!(index.match_name("First Honda"), Some("0042"));
        // Containment with no exact hit takes the first entry in store
        // order; "firsthonda" sits before "firsthondaofpeoria".
        assert_eq!(index.match_name("First Honda of Peoria LLC"), Some("0042"));
        // Unambiguous containment resolves normally.
        assert_eq!(index.match_name("Peoria"), Some("0043"));
        assert_eq!(index.match_name("Totally Unknown Motors"), None);
        assert_eq!(index.match_name(""), None);
    }

    #[test]
    fn test_dealer_index_first_match_wins_on_ambiguity() {
        let index = DealerIndex {
            names: vec![
                ("honda".into(), "0001".into()),
                ("hondaofpeoria".into(), "0002".into()),
            ],
            codes: HashMap::new(),
        };
        // Both entries contain-match "Honda Peo"; the first wins.
        assert_eq!(index.match_name("hondaof"), Some("0001"));
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(parse_date("2024-03-15"), Some(expected));
        assert_eq!(parse_date("03/15/2024"), Some(expected));
        assert_eq!(parse_date("03/15/24"), Some(expected));
        assert_eq!(parse_date("15-Mar-2024"), Some(expected));
        // Pre-2000 two-digit years stay in the right century.
        assert_eq!(
            parse_date("12/31/99"),
            NaiveDate::from_ymd_opt(1999, 12, 31)
        );
        assert_eq!(parse_date("not a date"), None);
    }

    #[test]
    fn test_sentinel_dates() {
        assert!(is_sentinel_date(""));
        assert!(is_sentinel_date("  -  "));
        assert!(is_sentinel_date("1899-12-30"));
        assert!(is_sentinel_date("12/30/1899"));
        assert!(is_sentinel_date("1970-01-01"));
        assert!(!is_sentinel_date("2024-03-15"));
    }

    #[test]
    fn test_parse_count_and_amount() {
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count("12.0"), Some(12));
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_amount("$1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("(500.00)"), Some(-500.0));
        assert_eq!(parse_amount("junk"), None);
    }
}
