//! Streaming delimited-text parser and the shared row normalizer.
//!
//! Spreadsheet cell tuples are pushed through the same
//! [`normalize_tuples`] step, so both input shapes produce identical row
//! mappings downstream.

use super::{normalize_header, DecodeOptions, Row, HEADER_SCAN_WINDOW};
use crate::error::DecodeError;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Parse delimited text into normalized headers plus row maps.
pub fn parse(buffer: &[u8], opts: &DecodeOptions) -> Result<(Vec<String>, Vec<Row>), DecodeError> {
    let buffer = buffer.strip_prefix(UTF8_BOM).unwrap_or(buffer);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(opts.delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(buffer);

    let mut tuples: Vec<Vec<String>> = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| DecodeError::Delimited(e.to_string()))?;
        tuples.push(record.iter().map(|cell| cell.to_string()).collect());
    }

    normalize_tuples(tuples, opts)
}

/// Shared normalization: header discovery (or positional mapping), header
/// snake-casing, and tuple-to-map conversion. Rows stay in source order;
/// cell values pass through untouched.
pub fn normalize_tuples(
    tuples: Vec<Vec<String>>,
    opts: &DecodeOptions,
) -> Result<(Vec<String>, Vec<Row>), DecodeError> {
    if let Some(fixed) = &opts.fixed_columns {
        let headers = fixed.clone();
        let rows = tuples
            .into_iter()
            .filter(|t| t.iter().any(|c| !c.trim().is_empty()))
            .map(|t| to_row(&headers, t))
            .collect();
        return Ok((headers, rows));
    }

    if tuples.is_empty() {
        return Err(DecodeError::Delimited("input contains no rows".into()));
    }

    let header_idx = find_header_row(&tuples, opts)?;
    let headers: Vec<String> = tuples[header_idx]
        .iter()
        .map(|cell| normalize_header(cell))
        .collect();

    let rows = tuples
        .into_iter()
        .skip(header_idx + 1)
        .filter(|t| t.iter().any(|c| !c.trim().is_empty()))
        .map(|t| to_row(&headers, t))
        .collect();

    Ok((headers, rows))
}

/// Locate the header row. With no token configured the first row is the
/// header; otherwise the first row in the scan window containing the
/// token (after normalization) wins.
fn find_header_row(tuples: &[Vec<String>], opts: &DecodeOptions) -> Result<usize, DecodeError> {
    let Some(token) = &opts.header_token else {
        return Ok(0);
    };

    for (idx, row) in tuples.iter().take(HEADER_SCAN_WINDOW).enumerate() {
        if row.iter().any(|cell| normalize_header(cell).contains(token.as_str())) {
            return Ok(idx);
        }
    }

    Err(DecodeError::Delimited(format!(
        "no header row containing '{}' within the first {} rows",
        token, HEADER_SCAN_WINDOW
    )))
}

fn to_row(headers: &[String], tuple: Vec<String>) -> Row {
    let mut row = Row::with_capacity(headers.len());
    for (i, header) in headers.iter().enumerate() {
        if header.is_empty() {
            continue;
        }
        let value = tuple.get(i).cloned().unwrap_or_default();
        row.insert(header.clone(), value);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> DecodeOptions {
        DecodeOptions {
            delimiter: b',',
            ..Default::default()
        }
    }

    #[test]
    fn test_round_trip_values_unchanged() {
        let input = b"Dealer Code,Dealer Name,ZIP\n0042, First Honda ,61602\n0666,Acura of Peoria (666),61614\n";
        let (headers, rows) = parse(input, &opts()).unwrap();
        assert_eq!(headers, vec!["dealer_code", "dealer_name", "zip"]);
        assert_eq!(rows.len(), 2);
        // No trimming or coercion on the value path.
        assert_eq!(rows[0]["dealer_name"], " First Honda ");
        assert_eq!(rows[1]["dealer_name"], "Acura of Peoria (666)");
    }

    #[test]
    fn test_bom_is_stripped() {
        let input = b"\xEF\xBB\xBFCode,Name\n1,a\n";
        let (headers, _) = parse(input, &opts()).unwrap();
        assert_eq!(headers[0], "code");
    }

    #[test]
    fn test_pipe_delimiter() {
        let input = b"Dealer Name|Amount\nAcura of Peoria (666)|125.50\n";
        let o = DecodeOptions {
            delimiter: b'|',
            ..Default::default()
        };
        let (headers, rows) = parse(input, &o).unwrap();
        assert_eq!(headers, vec!["dealer_name", "amount"]);
        assert_eq!(rows[0]["amount"], "125.50");
    }

    #[test]
    fn test_short_rows_padded_with_empty() {
        let input = b"a,b,c\n1,2\n";
        let (_, rows) = parse(input, &opts()).unwrap();
        assert_eq!(rows[0]["c"], "");
    }

    #[test]
    fn test_header_token_skips_title_rows() {
        let input = b"Monthly Units Report\nGenerated 2024-03-01\nDealer Name,New,Used\nFirst Honda,10,4\n";
        let o = DecodeOptions {
            delimiter: b',',
            header_token: Some("dealer".into()),
            ..Default::default()
        };
        let (headers, rows) = parse(input, &o).unwrap();
        assert_eq!(headers, vec!["dealer_name", "new", "used"]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["new"], "10");
    }

    #[test]
    fn test_header_token_missing_is_error() {
        let input = b"x,y\n1,2\n";
        let o = DecodeOptions {
            delimiter: b',',
            header_token: Some("dealer".into()),
            ..Default::default()
        };
        assert!(parse(input, &o).is_err());
    }

    #[test]
    fn test_fixed_columns_positional_mapping() {
        let input = b"Acura of Peoria,2024,3,12,7,845.00\n";
        let o = DecodeOptions {
            delimiter: b',',
            fixed_columns: Some(
                ["dealer_name", "year", "month", "ext", "int", "amount"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            ..Default::default()
        };
        let (_, rows) = parse(input, &o).unwrap();
        assert_eq!(rows[0]["dealer_name"], "Acura of Peoria");
        assert_eq!(rows[0]["amount"], "845.00");
    }

    #[test]
    fn test_blank_rows_dropped() {
        let input = b"a,b\n1,2\n,\n3,4\n";
        let (_, rows) = parse(input, &opts()).unwrap();
        assert_eq!(rows.len(), 2);
    }
}
