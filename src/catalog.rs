//! Reader for the catalog "all types" dump.
//!
//! Each line is `type \t key \t revision \t last_modified \t {JSON}`. Editions, redirects and
//! works are turned into [`CatalogRecord`]s; every other type is counted and dropped.

use crate::config::HOLDING_SOURCE_PREFIX;
use crate::error::LineError;
use crate::models::{CatalogRecord, Edition, Redirect};
use crate::parser::{as_str, key_id, split_columns, DumpLines};
use crate::stats::ParseStats;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::io::BufRead;
use tracing::{debug, info};

/// Edition (`M`) and work (`W`) identifiers; authors and other keys never enter the redirect graph.
static EDITION_OR_WORK_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^OL[0-9]+[MW]$").unwrap());

const TYPE_EDITION: &str = "/type/edition";
const TYPE_REDIRECT: &str = "/type/redirect";
const TYPE_WORK: &str = "/type/work";

#[derive(Deserialize)]
struct EditionPayload {
    key: Option<String>,
    works: Option<Value>,
    ocaid: Option<Value>,
    source_records: Option<Value>,
}

#[derive(Deserialize)]
struct RedirectPayload {
    location: Option<String>,
}

pub struct CatalogReader<R> {
    lines: DumpLines<R>,
    stats: ParseStats,
}

impl<R: BufRead> CatalogReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: DumpLines::new(reader),
            stats: ParseStats::new(),
        }
    }

    /// Ends the stream, surfacing any read error that cut it short.
    pub fn finish(mut self) -> Result<ParseStats> {
        if let Some(e) = self.lines.take_error() {
            return Err(e).context("Failed reading catalog dump");
        }
        info!(
            lines = self.stats.lines,
            records = self.stats.records,
            ignored = self.stats.ignored,
            skipped = self.stats.skipped(),
            "Catalog dump parsed"
        );
        Ok(self.stats)
    }
}

impl<R: BufRead> Iterator for CatalogReader<R> {
    type Item = CatalogRecord;

    fn next(&mut self) -> Option<CatalogRecord> {
        while let Some(line) = self.lines.next_line() {
            self.stats.lines += 1;
            if line.is_empty() {
                self.stats.ignored += 1;
                continue;
            }
            match parse_catalog_line(line) {
                Ok(Some(record)) => {
                    self.stats.records += 1;
                    return Some(record);
                }
                Ok(None) => self.stats.ignored += 1,
                Err(err) => {
                    debug!(line = self.stats.lines, error = %err, "Skipping catalog line");
                    self.stats.record_skip(&err);
                }
            }
        }
        None
    }
}

/// Parses one dump line. `Ok(None)` marks a well-formed line of a type the pipeline ignores.
pub fn parse_catalog_line(line: &[u8]) -> Result<Option<CatalogRecord>, LineError> {
    let [kind, key, _revision, _modified, payload] = split_columns::<5>(line, true)?;
    let kind = as_str(kind)?;

    match kind {
        TYPE_EDITION => {
            parse_edition(as_str(key)?, payload).map(|e| Some(CatalogRecord::Edition(e)))
        }
        TYPE_REDIRECT => {
            parse_redirect(as_str(key)?, payload).map(|r| r.map(CatalogRecord::Redirect))
        }
        TYPE_WORK => {
            let id = key_id(as_str(key)?).ok_or(LineError::MissingField("work key"))?;
            Ok(Some(CatalogRecord::Work(id.to_string())))
        }
        _ => Ok(None),
    }
}

fn parse_edition(key: &str, payload: &[u8]) -> Result<Edition, LineError> {
    let payload: EditionPayload =
        serde_json::from_slice(payload).map_err(|_| LineError::InvalidJson)?;

    let edition_id = payload
        .key
        .as_deref()
        .and_then(key_id)
        .or_else(|| key_id(key))
        .ok_or(LineError::MissingField("edition key"))?
        .to_string();

    let work_ids = match &payload.works {
        Some(Value::Array(works)) => works
            .iter()
            .filter_map(|w| w.get("key").and_then(Value::as_str))
            .filter_map(key_id)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    let holding_id = payload
        .ocaid
        .as_ref()
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let has_source_record = match (&holding_id, &payload.source_records) {
        (Some(holding), Some(Value::Array(records))) => records
            .iter()
            .filter_map(Value::as_str)
            .any(|r| names_holding(r, holding)),
        _ => false,
    };

    Ok(Edition {
        edition_id,
        work_ids,
        holding_id,
        has_source_record,
    })
}

/// Whether a `source_records` entry is the holdings provenance entry `ia:<holding_id>`.
fn names_holding(record: &str, holding_id: &str) -> bool {
    record
        .strip_prefix(HOLDING_SOURCE_PREFIX)
        .is_some_and(|rest| rest == holding_id)
}

fn parse_redirect(key: &str, payload: &[u8]) -> Result<Option<Redirect>, LineError> {
    let origin = key_id(key).ok_or(LineError::MissingField("redirect key"))?;
    if !EDITION_OR_WORK_ID.is_match(origin) {
        return Ok(None);
    }

    let payload: RedirectPayload =
        serde_json::from_slice(payload).map_err(|_| LineError::InvalidJson)?;
    let destination = payload
        .location
        .as_deref()
        .and_then(key_id)
        .ok_or(LineError::MissingField("redirect location"))?;

    Ok(Some(Redirect {
        origin_id: origin.to_string(),
        destination_id: destination.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const EDITION_LINE: &str = r#"/type/edition	/books/OL003M	4	2010-04-14T02:44:13.274395	{"publishers": ["J. & A. Churchill"], "key": "/books/OL003M", "ocaid": "backlink_diff_editions_same_work", "source_records": ["ia:backlink_diff_editions_same_work", "marc:marc_columbia/part01.dat:1:2"], "works": [{"key": "/works/OL003W"}], "type": {"key": "/type/edition"}, "revision": 4}"#;

    const MULTI_WORK_LINE: &str = r#"/type/edition	/books/OL1002158M	11	2021-02-12T23:39:01.417876	{"key": "/books/OL1002158M", "source_records": ["marc:marc_columbia/part01.dat:1:2", null], "works": [{"key": "/works/OL1883432W"}, {"key": "/works/OL0000000W"}], "ocaid": "organizinggenius0000benn"}"#;

    const REDIRECT_LINE: &str = r#"/type/redirect	/books/OL001M	3	2010-04-14T02:53:24.620268	{"location": "/books/OL002M", "key": "/books/OL001M", "type": {"key": "/type/redirect"}, "revision": 3}"#;

    const AUTHOR_REDIRECT_LINE: &str = r#"/type/redirect	/authors/OL10219261A	2	2010-04-14T02:53:24.620268	{"location": "/authors/OL3894951A"}"#;

    const AUTHOR_LINE: &str = r#"/type/author	/authors/OL001A	4	2010-04-14T02:44:13.274395	{"name": "Brian D. Egger", "key": "/authors/OL001A"}"#;

    const WORK_LINE: &str = r#"/type/work	/works/OL003W	2	2010-04-14T02:44:13.274395	{"key": "/works/OL003W", "title": "Commercial organic analysis"}"#;

    fn parse(line: &str) -> Result<Option<CatalogRecord>, LineError> {
        parse_catalog_line(line.as_bytes())
    }

    #[test]
    fn edition_with_holding_and_source_record() {
        let record = parse(EDITION_LINE).unwrap();
        assert_eq!(
            record,
            Some(CatalogRecord::Edition(Edition {
                edition_id: "OL003M".into(),
                work_ids: vec!["OL003W".into()],
                holding_id: Some("backlink_diff_editions_same_work".into()),
                has_source_record: true,
            }))
        );
    }

    #[test]
    fn edition_with_multiple_works_without_source_record() {
        let Some(CatalogRecord::Edition(edition)) = parse(MULTI_WORK_LINE).unwrap() else {
            panic!("expected an edition");
        };
        assert_eq!(edition.work_ids, vec!["OL1883432W", "OL0000000W"]);
        assert!(edition.has_multiple_works());
        // "marc_columbia" contains "ia" but is not an `ia:` provenance entry
        assert!(!edition.has_source_record);
    }

    #[test]
    fn provenance_entry_must_name_the_claimed_holding() {
        let line = r#"/type/edition	/books/OL3M	1	2010	{"key": "/books/OL3M", "ocaid": "item_c", "source_records": ["ia:unrelated_item", "ia:item_c_extra"]}"#;
        let Some(CatalogRecord::Edition(edition)) = parse(line).unwrap() else {
            panic!("expected an edition");
        };
        assert_eq!(edition.holding_id.as_deref(), Some("item_c"));
        assert!(!edition.has_source_record);

        let line = r#"/type/edition	/books/OL4M	1	2010	{"key": "/books/OL4M", "source_records": ["ia:item_d"]}"#;
        let Some(CatalogRecord::Edition(edition)) = parse(line).unwrap() else {
            panic!("expected an edition");
        };
        assert!(!edition.has_source_record);
    }

    #[test]
    fn edition_without_works_or_ocaid() {
        let line = "/type/edition\t/books/OL9M\t1\t2010\t{\"key\": \"/books/OL9M\"}";
        let Some(CatalogRecord::Edition(edition)) = parse(line).unwrap() else {
            panic!("expected an edition");
        };
        assert!(edition.work_ids.is_empty());
        assert_eq!(edition.holding_id, None);
        assert!(!edition.has_source_record);
    }

    #[test]
    fn edition_key_falls_back_to_column() {
        let line = "/type/edition\t/books/OL9M\t1\t2010\t{\"ocaid\": \"\"}";
        let Some(CatalogRecord::Edition(edition)) = parse(line).unwrap() else {
            panic!("expected an edition");
        };
        assert_eq!(edition.edition_id, "OL9M");
        assert_eq!(edition.holding_id, None);
    }

    #[test]
    fn edition_redirect() {
        assert_eq!(
            parse(REDIRECT_LINE).unwrap(),
            Some(CatalogRecord::Redirect(Redirect {
                origin_id: "OL001M".into(),
                destination_id: "OL002M".into(),
            }))
        );
    }

    #[test]
    fn author_redirect_is_ignored() {
        assert_eq!(parse(AUTHOR_REDIRECT_LINE).unwrap(), None);
    }

    #[test]
    fn author_is_ignored() {
        assert_eq!(parse(AUTHOR_LINE).unwrap(), None);
    }

    #[test]
    fn work_is_recorded() {
        assert_eq!(
            parse(WORK_LINE).unwrap(),
            Some(CatalogRecord::Work("OL003W".into()))
        );
    }

    #[test]
    fn malformed_lines_are_classified() {
        assert_eq!(
            parse("/type/redirect\t/books/OL005M"),
            Err(LineError::ColumnCount {
                expected: 5,
                found: 2
            })
        );
        assert_eq!(
            parse("/type/edition\t/books/OL9M\t1\t2010\t{not json"),
            Err(LineError::InvalidJson)
        );
        assert_eq!(
            parse("/type/redirect\t/books/OL9M\t1\t2010\t{}"),
            Err(LineError::MissingField("redirect location"))
        );
        assert_eq!(
            parse_catalog_line(b"/type/edition\t/books/\xff\t1\t2010\t{}"),
            Err(LineError::InvalidUtf8)
        );
    }

    #[test]
    fn reader_skips_and_counts() {
        let dump = [
            "/type/redirect\t/books/OL005M",
            REDIRECT_LINE,
            EDITION_LINE,
            AUTHOR_LINE,
            "/type/edition\t/books/OL9M\t1\t2010\t{not json",
            WORK_LINE,
        ]
        .join("\n");

        let mut reader = CatalogReader::new(Cursor::new(dump.into_bytes()));
        let records: Vec<CatalogRecord> = reader.by_ref().collect();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], CatalogRecord::Redirect(_)));
        assert!(matches!(records[1], CatalogRecord::Edition(_)));
        assert!(matches!(records[2], CatalogRecord::Work(_)));

        let stats = reader.finish().unwrap();
        assert_eq!(stats.lines, 6);
        assert_eq!(stats.records, 3);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.bad_columns, 1);
        assert_eq!(stats.invalid_json, 1);
        assert_eq!(stats.skipped(), 2);
    }
}
