//! Tabular Decoder
//!
//! Turns a raw byte buffer into ordered row mappings (normalized column
//! key to raw string value) for both delimited text and spreadsheet
//! binaries. The spreadsheet path never materializes a workbook object
//! model; it walks the archive directly (see [`xlsx`]) and feeds the
//! extracted cell tuples through the same normalizer the text path uses.

pub mod delimited;
pub mod xlsx;

use std::collections::HashMap;

use regex::Regex;

use crate::error::DecodeError;
use crate::types::FileKind;

/// One decoded data row: normalized header key to raw cell string.
pub type Row = HashMap<String, String>;

/// Rows from one worksheet (or the single logical sheet of a text file),
/// tagged with the reporting period parsed from the sheet tab name when
/// the source is a one-sheet-per-month workbook.
#[derive(Debug, Clone)]
pub struct DecodedSheet {
    pub name: Option<String>,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

/// Per-source decode configuration. Layouts are hardcoded per known
/// source format; this is not a general ETL surface.
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Field delimiter for text inputs.
    pub delimiter: u8,
    /// Fixed ordered column names for headerless layouts; mapped by
    /// position instead of by header row.
    pub fixed_columns: Option<Vec<String>>,
    /// When the real header sits below title/subtitle rows, the first row
    /// within the scan window containing this normalized token is used.
    pub header_token: Option<String>,
    /// Whether every sheet of a workbook is decoded (one per reporting
    /// month) instead of just the first.
    pub all_sheets: bool,
    /// Year assumed for sheet tab names that carry only a month.
    pub fallback_year: Option<i32>,
}

/// Rows scanned when looking for a recognizable header row.
const HEADER_SCAN_WINDOW: usize = 10;

impl DecodeOptions {
    pub fn for_kind(kind: FileKind, fallback_year: Option<i32>) -> Self {
        match kind {
            FileKind::DealerMaster => Self {
                delimiter: b',',
                ..Default::default()
            },
            FileKind::Contracts => Self {
                delimiter: b',',
                ..Default::default()
            },
            FileKind::Units => Self {
                // The units report carries two title rows above its header.
                delimiter: b',',
                header_token: Some("dealer".into()),
                ..Default::default()
            },
            FileKind::Zie => Self {
                // Headerless fixed export; columns are positional.
                delimiter: b',',
                fixed_columns: Some(
                    [
                        "dealer_name",
                        "year",
                        "month",
                        "exterior_repairs",
                        "interior_repairs",
                        "service_amount",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                ),
                ..Default::default()
            },
            FileKind::Billing => Self {
                delimiter: b'|',
                ..Default::default()
            },
            FileKind::CampaignResults => Self {
                delimiter: b',',
                all_sheets: true,
                fallback_year,
                ..Default::default()
            },
        }
    }
}

/// Decode a raw buffer into one or more sheets of rows.
///
/// CPU-bound and non-suspending by design; callers that need heartbeats
/// while this runs wrap it in a blocking task.
pub fn decode(
    buffer: &[u8],
    kind: FileKind,
    fallback_year: Option<i32>,
) -> Result<Vec<DecodedSheet>, DecodeError> {
    let opts = DecodeOptions::for_kind(kind, fallback_year);

    if xlsx::is_spreadsheet_archive(buffer) {
        decode_spreadsheet(buffer, &opts)
    } else {
        let (headers, rows) = delimited::parse(buffer, &opts)?;
        Ok(vec![DecodedSheet {
            name: None,
            year: None,
            month: None,
            headers,
            rows,
        }])
    }
}

fn decode_spreadsheet(
    buffer: &[u8],
    opts: &DecodeOptions,
) -> Result<Vec<DecodedSheet>, DecodeError> {
    let workbook = xlsx::decode_workbook(buffer)?;
    let mut sheets = Vec::new();

    for (idx, (name, tuples)) in workbook.into_iter().enumerate() {
        let period = if opts.all_sheets {
            match parse_sheet_period(&name, opts.fallback_year) {
                Some(p) => Some(p),
                // Sheets whose tab name yields no month are skipped.
                None => continue,
            }
        } else {
            if idx > 0 {
                break;
            }
            None
        };

        let (headers, rows) = delimited::normalize_tuples(tuples, opts)
            .map_err(|e| DecodeError::sheet(&name, e.to_string()))?;

        sheets.push(DecodedSheet {
            name: Some(name),
            year: period.map(|(y, _)| y),
            month: period.map(|(_, m)| m),
            headers,
            rows,
        });
    }

    if sheets.is_empty() {
        return Err(DecodeError::archive(
            "workbook",
            "no decodable sheets found",
        ));
    }
    Ok(sheets)
}

const MONTH_NAMES: [(&str, u32); 12] = [
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
];

/// Parse a month and year out of a worksheet tab name.
///
/// Accepts full or abbreviated month names or a bare 1-2 digit month,
/// combined with any 4-digit year found anywhere in the name, else the
/// supplied fallback year. Returns None when no month can be recognized.
pub fn parse_sheet_period(name: &str, fallback_year: Option<i32>) -> Option<(i32, u32)> {
    let lower = name.to_lowercase();

    let year = Regex::new(r"\b(\d{4})\b")
        .ok()?
        .captures(&lower)
        .and_then(|c| c[1].parse::<i32>().ok())
        .or(fallback_year)?;

    // Month names match whole tokens only (abbreviations of three or more
    // letters count), so "Summary" does not read as March.
    for token in lower.split(|c: char| !c.is_ascii_alphabetic()) {
        if token.len() < 3 {
            continue;
        }
        for (month_name, month) in MONTH_NAMES {
            if month_name.starts_with(token) {
                return Some((year, month));
            }
        }
    }

    // Bare numeric month, e.g. "3" or "03 2024".
    for token in lower.split(|c: char| !c.is_ascii_digit()) {
        if token.is_empty() || token.len() > 2 {
            continue;
        }
        if let Ok(m) = token.parse::<u32>() {
            if (1..=12).contains(&m) {
                return Some((year, m));
            }
        }
    }

    None
}

/// Normalize a header cell: trim, lowercase, collapse every run of
/// non-alphanumerics into a single underscore.
pub fn normalize_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_header_snake_cases() {
        assert_eq!(normalize_header("Dealer Name"), "dealer_name");
        assert_eq!(normalize_header("  Agreement #  "), "agreement");
        assert_eq!(normalize_header("Cancel/Post Date"), "cancel_post_date");
        assert_eq!(normalize_header("VIN"), "vin");
    }

    #[test]
    fn test_sheet_period_full_and_abbreviated_names() {
        assert_eq!(parse_sheet_period("January 2024", None), Some((2024, 1)));
        assert_eq!(parse_sheet_period("Mar 2023", None), Some((2023, 3)));
        assert_eq!(parse_sheet_period("sept results", Some(2022)), Some((2022, 9)));
    }

    #[test]
    fn test_sheet_period_bare_month_uses_fallback_year() {
        assert_eq!(parse_sheet_period("07", Some(2024)), Some((2024, 7)));
        assert_eq!(parse_sheet_period("3", None), None);
    }

    #[test]
    fn test_sheet_period_unrecognized_is_none() {
        // "Summary" contains "mar" and "Marketing" starts with it; neither
        // names a month.
        assert_eq!(parse_sheet_period("Summary", Some(2024)), None);
        assert_eq!(parse_sheet_period("Marketing 2024", None), None);
        assert_eq!(parse_sheet_period("Totals 2024", None), None);
    }

    #[test]
    fn test_decode_plain_csv_single_sheet() {
        let csv = b"Dealer Code,Dealer Name\n0042,First Honda\n";
        let sheets = decode(csv, FileKind::DealerMaster, None).unwrap();
        assert_eq!(sheets.len(), 1);
        assert_eq!(sheets[0].headers, vec!["dealer_code", "dealer_name"]);
        assert_eq!(sheets[0].rows[0]["dealer_code"], "0042");
    }
}
