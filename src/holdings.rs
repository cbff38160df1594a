//! Reader for the digitized-holdings dump.
//!
//! Two layouts are accepted: one JSON object per line (`identifier`, `openlibrary_edition`,
//! `openlibrary_work`, `isbn`), and the tab-separated direct export whose columns 2-4 are the
//! holding, edition and work identifiers.

use crate::error::LineError;
use crate::models::HoldingItem;
use crate::parser::{as_str, dump_extension, key_id, split_columns, DumpLines};
use crate::stats::ParseStats;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldingsFormat {
    JsonLines,
    Tsv,
}

impl HoldingsFormat {
    pub fn detect(path: &Path) -> Self {
        match dump_extension(path) {
            Some("tsv") | Some("txt") => HoldingsFormat::Tsv,
            _ => HoldingsFormat::JsonLines,
        }
    }
}

#[derive(Deserialize)]
struct HoldingPayload {
    identifier: Option<String>,
    openlibrary_edition: Option<String>,
    openlibrary_work: Option<String>,
    isbn: Option<Value>,
}

pub struct HoldingsReader<R> {
    lines: DumpLines<R>,
    format: HoldingsFormat,
    stats: ParseStats,
}

impl<R: BufRead> HoldingsReader<R> {
    pub fn new(reader: R, format: HoldingsFormat) -> Self {
        Self {
            lines: DumpLines::new(reader),
            format,
            stats: ParseStats::new(),
        }
    }

    pub fn finish(mut self) -> Result<ParseStats> {
        if let Some(e) = self.lines.take_error() {
            return Err(e).context("Failed reading holdings dump");
        }
        info!(
            lines = self.stats.lines,
            records = self.stats.records,
            skipped = self.stats.skipped(),
            "Holdings dump parsed"
        );
        Ok(self.stats)
    }
}

impl<R: BufRead> Iterator for HoldingsReader<R> {
    type Item = HoldingItem;

    fn next(&mut self) -> Option<HoldingItem> {
        while let Some(line) = self.lines.next_line() {
            self.stats.lines += 1;
            if line.is_empty() {
                self.stats.ignored += 1;
                continue;
            }
            let parsed = match self.format {
                HoldingsFormat::JsonLines => parse_json_line(line),
                HoldingsFormat::Tsv => parse_tsv_line(line),
            };
            match parsed {
                Ok(item) => {
                    self.stats.records += 1;
                    return Some(item);
                }
                Err(err) => {
                    debug!(line = self.stats.lines, error = %err, "Skipping holdings line");
                    self.stats.record_skip(&err);
                }
            }
        }
        None
    }
}

pub fn parse_json_line(line: &[u8]) -> Result<HoldingItem, LineError> {
    let payload: HoldingPayload =
        serde_json::from_slice(line).map_err(|_| LineError::InvalidJson)?;

    let holding_id = non_empty(payload.identifier.as_deref())
        .ok_or(LineError::MissingField("identifier"))?
        .to_string();
    let isbns = payload
        .isbn
        .as_ref()
        .map(normalized_isbn13s)
        .unwrap_or_default();

    Ok(HoldingItem {
        holding_id,
        linked_edition_id: payload
            .openlibrary_edition
            .as_deref()
            .and_then(key_id)
            .map(str::to_string),
        linked_work_id: payload
            .openlibrary_work
            .as_deref()
            .and_then(key_id)
            .map(str::to_string),
        sole_isbn13: isbns.len() == 1,
        isbn13: isbns.into_iter().next_back(),
    })
}

pub fn parse_tsv_line(line: &[u8]) -> Result<HoldingItem, LineError> {
    let [_, holding, edition, work] = split_columns::<4>(line, false)?;

    let holding_id = non_empty(Some(as_str(holding)?))
        .ok_or(LineError::MissingField("identifier"))?
        .to_string();

    Ok(HoldingItem {
        holding_id,
        linked_edition_id: key_id(as_str(edition)?).map(str::to_string),
        linked_work_id: key_id(as_str(work)?).map(str::to_string),
        isbn13: None,
        sole_isbn13: false,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// The dump stores `isbn` as a string or a list mixing ISBN-10 and ISBN-13 forms. All are
/// brought to ISBN-13 form; the item keeps the greatest distinct value.
fn normalized_isbn13s(value: &Value) -> BTreeSet<String> {
    let raw: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    raw.into_iter().filter_map(to_isbn13).collect()
}

/// Normalizes an ISBN string to 13-digit form. Check digits of the input are not verified.
pub fn to_isbn13(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !matches!(c, '-' | ' ')).collect();
    let bytes = compact.as_bytes();

    match bytes.len() {
        13 if bytes.iter().all(u8::is_ascii_digit) => Some(compact),
        10 if bytes[..9].iter().all(u8::is_ascii_digit)
            && (bytes[9].is_ascii_digit() || matches!(bytes[9], b'X' | b'x')) =>
        {
            let body = format!("978{}", &compact[..9]);
            let sum: u32 = body
                .bytes()
                .enumerate()
                .map(|(i, b)| u32::from(b - b'0') * if i % 2 == 0 { 1 } else { 3 })
                .sum();
            let check = (10 - sum % 10) % 10;
            Some(format!("{}{}", body, check))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn json_line_with_links() {
        let line = br#"{"identifier": "links_both_ways", "isbn": ["9781451675504", "145167550X"], "openlibrary_work": "OL011W", "openlibrary_edition": "OL011M"}"#;
        assert_eq!(
            parse_json_line(line).unwrap(),
            HoldingItem {
                holding_id: "links_both_ways".into(),
                linked_edition_id: Some("OL011M".into()),
                linked_work_id: Some("OL011W".into()),
                isbn13: Some("9781451675504".into()),
                sole_isbn13: true,
            }
        );
    }

    #[test]
    fn json_line_without_links() {
        let line = br#"{"identifier": "orphan_item", "openlibrary_edition": ""}"#;
        let item = parse_json_line(line).unwrap();
        assert_eq!(item.holding_id, "orphan_item");
        assert_eq!(item.linked_edition_id, None);
        assert_eq!(item.isbn13, None);
        assert!(!item.sole_isbn13);
    }

    #[test]
    fn json_line_isbn_as_string() {
        let line = br#"{"identifier": "single", "isbn": "0-201-57051-3"}"#;
        let item = parse_json_line(line).unwrap();
        assert_eq!(item.isbn13.as_deref(), Some("9780201570519"));
        assert!(item.sole_isbn13);
    }

    #[test]
    fn json_line_multiple_isbn13_keeps_greatest() {
        let line = br#"{"identifier": "two", "isbn": ["1933060220", "9781933060224", "9781566199094"]}"#;
        let item = parse_json_line(line).unwrap();
        assert_eq!(item.isbn13.as_deref(), Some("9781933060224"));
        assert!(!item.sole_isbn13);
    }

    #[test]
    fn json_line_missing_identifier() {
        assert_eq!(
            parse_json_line(br#"{"openlibrary_edition": "OL1M"}"#),
            Err(LineError::MissingField("identifier"))
        );
        assert_eq!(parse_json_line(b"{oops"), Err(LineError::InvalidJson));
    }

    #[test]
    fn tsv_line() {
        let item = parse_tsv_line(b"1\tgoldenass0000apul_k5d0\tOL1426680M\tOL2W\textra").unwrap();
        assert_eq!(item.holding_id, "goldenass0000apul_k5d0");
        assert_eq!(item.linked_edition_id.as_deref(), Some("OL1426680M"));
        assert_eq!(item.linked_work_id.as_deref(), Some("OL2W"));

        let item = parse_tsv_line(b"2\tno_links\t\t").unwrap();
        assert_eq!(item.linked_edition_id, None);
        assert_eq!(item.linked_work_id, None);

        assert!(matches!(
            parse_tsv_line(b"3\tshort"),
            Err(LineError::ColumnCount { .. })
        ));
    }

    #[test]
    fn isbn10_converts() {
        assert_eq!(to_isbn13("0201570513").as_deref(), Some("9780201570519"));
        assert_eq!(to_isbn13("145167550X").as_deref(), Some("9781451675504"));
        assert_eq!(to_isbn13("978-1-4516-7550-4").as_deref(), Some("9781451675504"));
        assert_eq!(to_isbn13("not an isbn"), None);
    }

    #[test]
    fn format_detection() {
        assert_eq!(
            HoldingsFormat::detect(Path::new("inlibrary.jsonl")),
            HoldingsFormat::JsonLines
        );
        assert_eq!(
            HoldingsFormat::detect(Path::new("physical_direct.tsv.gz")),
            HoldingsFormat::Tsv
        );
    }

    #[test]
    fn reader_counts_skips() {
        let dump = "{\"identifier\": \"a\"}\n{broken\n\n{\"identifier\": \"b\"}\n";
        let mut reader = HoldingsReader::new(Cursor::new(dump), HoldingsFormat::JsonLines);
        let ids: Vec<String> = reader.by_ref().map(|h| h.holding_id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let stats = reader.finish().unwrap();
        assert_eq!(stats.lines, 4);
        assert_eq!(stats.records, 2);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.invalid_json, 1);
    }
}
