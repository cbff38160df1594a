//! Report engine.
//!
//! Every report is a tab-separated file with a header row, written to the reports
//! directory under its name. Rows come out in a fixed order so reruns over the same
//! store produce identical files.

use crate::config::ReconcileConfig;
use crate::error_log::ErrorLog;
use crate::index::{ItemMapIndex, RedirectIndex};
use crate::models::Resolution;
use crate::store::Store;
use anyhow::{Context, Result};
use csv::{Writer, WriterBuilder};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSummary {
    pub name: &'static str,
    pub rows: u64,
    pub distinct_rows: u64,
    pub path: PathBuf,
}

/// A report that is a single store query written out row for row.
struct QueryReport {
    name: &'static str,
    message: &'static str,
    header: &'static [&'static str],
    sql: &'static str,
}

const BROKEN_BACKLINKS: QueryReport = QueryReport {
    name: "broken_backlinks",
    message: "Editions claiming a holding that is absent from the holdings dump",
    header: &["edition_id", "holding_id"],
    sql: "SELECT e.edition_id, e.holding_id FROM editions e
          WHERE e.holding_id IS NOT NULL
            AND NOT EXISTS (SELECT 1 FROM holdings h WHERE h.holding_id = e.holding_id)
          ORDER BY e.edition_id",
};

const HOLDING_LINKS_EDITION_WITHOUT_HOLDING: QueryReport = QueryReport {
    name: "holding_links_edition_without_holding",
    message: "Holdings linking to an edition that claims no holding",
    header: &["holding_id", "edition_id"],
    sql: "SELECT h.holding_id, h.linked_edition_id FROM holdings h
          JOIN editions e ON e.edition_id = h.linked_edition_id
          WHERE e.holding_id IS NULL
          ORDER BY h.holding_id",
};

const HOLDING_LINKS_EDITION_WITHOUT_HOLDING_SOLE_ISBN: QueryReport = QueryReport {
    name: "holding_links_edition_without_holding_sole_isbn",
    message: "Holdings with a single ISBN-13 linking to an edition that claims no holding",
    header: &["holding_id", "edition_id", "isbn13"],
    sql: "SELECT h.holding_id, h.linked_edition_id, h.isbn13 FROM holdings h
          JOIN editions e ON e.edition_id = h.linked_edition_id
          WHERE e.holding_id IS NULL AND h.sole_isbn13 = 1
          ORDER BY h.holding_id",
};

const HOLDING_WITHOUT_SOURCE_RECORD: QueryReport = QueryReport {
    name: "holding_without_source_record",
    message: "Editions with a holding but no holdings provenance entry",
    header: &["edition_id", "holding_id"],
    sql: "SELECT edition_id, holding_id FROM editions
          WHERE holding_id IS NOT NULL AND has_source_record = 0
          ORDER BY edition_id",
};

const BACKLINK_MISMATCHES: QueryReport = QueryReport {
    name: "backlink_mismatches",
    message: "Holdings whose linked edition differs from the edition claiming them",
    header: &[
        "holding_id",
        "linked_edition_id",
        "linked_work_id",
        "claiming_edition_id",
        "claiming_work_id",
    ],
    sql: "SELECT h.holding_id, h.linked_edition_id, h.linked_work_id, e.edition_id, e.work_id
          FROM holdings h JOIN editions e ON e.holding_id = h.holding_id
          WHERE h.linked_edition_id IS NOT NULL AND h.linked_edition_id != e.edition_id
          ORDER BY h.holding_id, e.edition_id",
};

const HOLDING_LINKS_MISSING_EDITION: QueryReport = QueryReport {
    name: "holding_links_missing_edition",
    message: "Holdings linking to an edition absent from the catalog",
    header: &["holding_id", "linked_edition_id"],
    sql: "SELECT h.holding_id, h.linked_edition_id FROM holdings h
          WHERE h.linked_edition_id IS NOT NULL
            AND NOT EXISTS (SELECT 1 FROM editions e WHERE e.edition_id = h.linked_edition_id)
          ORDER BY h.holding_id",
};

const EDITIONS_WITH_MULTIPLE_HOLDINGS: QueryReport = QueryReport {
    name: "editions_with_multiple_holdings",
    message: "Holdings sharing a linked edition with another holding",
    header: &["holding_id", "edition_id"],
    sql: "SELECT h.holding_id, h.linked_edition_id FROM holdings h
          WHERE h.linked_edition_id IN (
              SELECT linked_edition_id FROM holdings
              WHERE linked_edition_id IS NOT NULL
              GROUP BY linked_edition_id HAVING COUNT(*) > 1)
          ORDER BY h.linked_edition_id, h.holding_id",
};

const WORK_MISMATCHES: QueryReport = QueryReport {
    name: "work_mismatches",
    message: "Holdings whose work differs from the work of the edition claiming them",
    header: &[
        "holding_id",
        "claiming_edition_id",
        "claiming_work_id",
        "linked_edition_id",
        "linked_work_id",
    ],
    sql: "SELECT h.holding_id, e.edition_id, e.work_id, h.linked_edition_id, h.linked_work_id
          FROM holdings h JOIN editions e ON e.holding_id = h.holding_id
          WHERE h.linked_work_id IS NOT e.work_id
          ORDER BY h.holding_id, e.edition_id",
};

const MULTI_WORK_EDITIONS: &str = "multi_work_editions";
const CLAIMED_IN_MEMORY: &str = "claimed_holding_no_backlink";
const CLAIMED_JOIN: &str = "claimed_holding_no_backlink_join";
const CLAIM_DISCREPANCIES: &str = "claim_variant_discrepancies";
const RESOLVED_BACKLINK_MISMATCHES: &str = "resolved_backlink_mismatches";
const RESOLVED_LINKS_MISSING_EDITION: &str = "resolved_links_missing_edition";

const CLAIM_HEADER: &[&str] = &["holding_id", "edition_id"];

struct ReportWriter {
    name: &'static str,
    message: &'static str,
    path: PathBuf,
    writer: Writer<BufWriter<File>>,
    rows: u64,
    seen: FxHashSet<u64>,
}

impl ReportWriter {
    fn create(
        config: &ReconcileConfig,
        name: &'static str,
        message: &'static str,
        header: &[&str],
    ) -> Result<Self> {
        fs::create_dir_all(&config.reports_dir).with_context(|| {
            format!(
                "Failed to create reports directory: {}",
                config.reports_dir.display()
            )
        })?;
        let path = config.report_path(name);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create report: {}", path.display()))?;
        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(BufWriter::with_capacity(256 * 1024, file));
        writer.write_record(header)?;

        Ok(Self {
            name,
            message,
            path,
            writer,
            rows: 0,
            seen: FxHashSet::default(),
        })
    }

    fn write<S: AsRef<str>>(&mut self, row: &[S]) -> Result<()> {
        let mut hasher = FxHasher::default();
        for field in row {
            field.as_ref().hash(&mut hasher);
        }
        self.seen.insert(hasher.finish());
        self.writer.write_record(row.iter().map(|f| f.as_ref()))?;
        self.rows += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<ReportSummary> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to write report: {}", self.path.display()))?;

        println!();
        println!("==> {}: {}", self.message, self.rows);
        println!("    De-duplicated count: {}", self.seen.len());
        println!("    Written to {}", self.path.display());
        info!(report = self.name, rows = self.rows, "Report written");

        Ok(ReportSummary {
            name: self.name,
            rows: self.rows,
            distinct_rows: self.seen.len() as u64,
            path: self.path,
        })
    }
}

fn run_query_report(
    store: &Store,
    config: &ReconcileConfig,
    report: &QueryReport,
) -> Result<ReportSummary> {
    let mut writer = ReportWriter::create(config, report.name, report.message, report.header)?;
    store
        .visit_rows(report.sql, |row| writer.write(row))
        .with_context(|| format!("Report {} failed", report.name))?;
    writer.finish()
}

/// Every report that needs only the store, in run order.
pub fn store_reports(
    store: &Store,
    config: &ReconcileConfig,
    log: &mut ErrorLog,
) -> Result<Vec<ReportSummary>> {
    let mut summaries = vec![run_query_report(store, config, &BROKEN_BACKLINKS)?];
    summaries.extend(claim_reports(store, config, log)?);
    summaries.push(multi_work_editions(store, config)?);
    summaries.push(run_query_report(
        store,
        config,
        &HOLDING_LINKS_EDITION_WITHOUT_HOLDING,
    )?);
    summaries.push(run_query_report(
        store,
        config,
        &HOLDING_LINKS_EDITION_WITHOUT_HOLDING_SOLE_ISBN,
    )?);
    summaries.push(run_query_report(store, config, &HOLDING_WITHOUT_SOURCE_RECORD)?);

    println!();
    println!("==> The next reports use joins and are slower.");
    for report in [
        &BACKLINK_MISMATCHES,
        &HOLDING_LINKS_MISSING_EDITION,
        &EDITIONS_WITH_MULTIPLE_HOLDINGS,
        &WORK_MISMATCHES,
    ] {
        summaries.push(run_query_report(store, config, report)?);
    }
    Ok(summaries)
}

/// Holdings without a back-link, paired with the edition claiming them. Editions are
/// collated by holding in load order, so a later claim replaces an earlier one.
fn claims_in_memory(store: &Store) -> Result<Vec<(String, String)>> {
    let mut claims: FxHashMap<String, String> = FxHashMap::default();
    store.visit_rows(
        "SELECT holding_id, edition_id FROM editions WHERE holding_id IS NOT NULL ORDER BY rowid",
        |row| {
            claims.insert(row[0].clone(), row[1].clone());
            Ok(())
        },
    )?;

    let mut rows = Vec::new();
    store.visit_rows(
        "SELECT holding_id FROM holdings WHERE linked_edition_id IS NULL ORDER BY holding_id",
        |row| {
            if let Some(edition) = claims.get(&row[0]) {
                rows.push((row[0].clone(), edition.clone()));
            }
            Ok(())
        },
    )?;
    Ok(rows)
}

/// Same question answered by a store join: one row per claiming edition.
fn claims_by_join(store: &Store) -> Result<Vec<(String, String)>> {
    let mut rows = Vec::new();
    store.visit_rows(
        "SELECT h.holding_id, e.edition_id FROM holdings h
         JOIN editions e ON e.holding_id = h.holding_id
         WHERE h.linked_edition_id IS NULL
         ORDER BY h.holding_id, e.edition_id",
        |row| {
            rows.push((row[0].clone(), row[1].clone()));
            Ok(())
        },
    )?;
    Ok(rows)
}

fn write_claims(
    config: &ReconcileConfig,
    name: &'static str,
    message: &'static str,
    claims: &[(String, String)],
) -> Result<ReportSummary> {
    let mut writer = ReportWriter::create(config, name, message, CLAIM_HEADER)?;
    for (holding, edition) in claims {
        writer.write(&[holding, edition])?;
    }
    writer.finish()
}

/// Both claimed-holding variants plus the rows on which they disagree.
pub fn claim_reports(
    store: &Store,
    config: &ReconcileConfig,
    log: &mut ErrorLog,
) -> Result<Vec<ReportSummary>> {
    let in_memory = claims_in_memory(store)?;
    let joined = claims_by_join(store)?;

    let mut summaries = vec![
        write_claims(
            config,
            CLAIMED_IN_MEMORY,
            "Holdings without a back-link that an edition claims (collated)",
            &in_memory,
        )?,
        write_claims(
            config,
            CLAIMED_JOIN,
            "Holdings without a back-link that an edition claims (join)",
            &joined,
        )?,
    ];
    summaries.push(claim_discrepancies(store, config, log, &in_memory, &joined)?);
    Ok(summaries)
}

fn claim_discrepancies(
    store: &Store,
    config: &ReconcileConfig,
    log: &mut ErrorLog,
    in_memory: &[(String, String)],
    joined: &[(String, String)],
) -> Result<ReportSummary> {
    let collated: BTreeSet<&(String, String)> = in_memory.iter().collect();
    let by_join: BTreeSet<&(String, String)> = joined.iter().collect();
    let multiply_claimed = store.multiply_claimed_holdings()?;

    let mut differing: Vec<(&str, &str, &str)> = collated
        .difference(&by_join)
        .map(|(h, e)| (h.as_str(), e.as_str(), "collated_only"))
        .chain(
            by_join
                .difference(&collated)
                .map(|(h, e)| (h.as_str(), e.as_str(), "join_only")),
        )
        .collect();
    differing.sort_unstable();

    let mut writer = ReportWriter::create(
        config,
        CLAIM_DISCREPANCIES,
        "Claimed-holding rows present in only one variant",
        &["holding_id", "edition_id", "variant", "multiply_claimed"],
    )?;
    for (holding, edition, variant) in differing {
        let explained = multiply_claimed.contains(holding);
        if !explained {
            log.append(
                CLAIM_DISCREPANCIES,
                &format!(
                    "holding {} claimed by {} appears only in the {} variant",
                    holding, edition, variant
                ),
            )?;
        }
        writer.write(&[holding, edition, variant, bool_field(explained)])?;
    }
    writer.finish()
}

fn bool_field(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// One row per edition listing more than one work, work ids in dump order.
pub fn multi_work_editions(store: &Store, config: &ReconcileConfig) -> Result<ReportSummary> {
    let mut writer = ReportWriter::create(
        config,
        MULTI_WORK_EDITIONS,
        "Editions with more than one associated work",
        &["edition_id", "work_ids"],
    )?;

    let mut current: Option<(String, Vec<String>)> = None;
    store.visit_rows(
        "SELECT w.edition_id, w.work_id FROM edition_works w
         JOIN editions e ON e.edition_id = w.edition_id
         WHERE e.has_multiple_works = 1
         ORDER BY w.edition_id, w.position",
        |row| {
            if let Some((edition, works)) = current.as_mut() {
                if *edition == row[0] {
                    works.push(row[1].clone());
                    return Ok(());
                }
            }
            if let Some((edition, works)) = current.take() {
                writer.write(&[edition, works.join(",")])?;
            }
            current = Some((row[0].clone(), vec![row[1].clone()]));
            Ok(())
        },
    )?;
    if let Some((edition, works)) = current {
        writer.write(&[edition, works.join(",")])?;
    }
    writer.finish()
}

/// Reports that re-check back-links after redirect resolution. Both indices must exist.
pub fn resolved_reports(
    store: &Store,
    config: &ReconcileConfig,
    log: &mut ErrorLog,
) -> Result<Vec<ReportSummary>> {
    let redirects = RedirectIndex::open(&config.redirect_index_path)?;
    let items = ItemMapIndex::open(&config.item_map_path)?;

    Ok(vec![
        resolved_backlink_mismatches(store, config, &redirects, &items, log)?,
        resolved_links_missing_edition(store, config, &redirects, log)?,
    ])
}

/// Terminal work of a terminal edition. An edition that resolved during indexing but is
/// gone from the store now is logged.
fn terminal_work(
    store: &Store,
    redirects: &RedirectIndex,
    edition_id: &str,
    log: &mut ErrorLog,
    source: &str,
) -> Result<Option<String>> {
    let Some(edition) = store.edition(edition_id)? else {
        log.append(
            source,
            &format!("terminal edition {} is missing from the store", edition_id),
        )?;
        return Ok(None);
    };
    match edition.work_id() {
        Some(work) => Ok(redirects.resolve(work)?.terminal().map(str::to_string)),
        None => Ok(None),
    }
}

fn resolved_backlink_mismatches(
    store: &Store,
    config: &ReconcileConfig,
    redirects: &RedirectIndex,
    items: &ItemMapIndex,
    log: &mut ErrorLog,
) -> Result<ReportSummary> {
    let mut writer = ReportWriter::create(
        config,
        RESOLVED_BACKLINK_MISMATCHES,
        "Back-link mismatches remaining after redirect resolution",
        &[
            "holding_id",
            "linked_edition_id",
            "resolved_linked_edition_id",
            "claiming_edition_id",
            "resolved_claiming_edition_id",
            "same_work",
        ],
    )?;
    let mut artifacts: u64 = 0;

    store.visit_rows(BACKLINK_MISMATCHES.sql, |row| {
        let holding = row[0].as_str();
        let linked = row[1].as_str();
        let claiming = row[3].as_str();

        let linked_terminal = redirects.resolve(linked)?;
        let claiming_terminal = redirects.resolve(claiming)?;
        if let (Some(a), Some(b)) = (linked_terminal.terminal(), claiming_terminal.terminal()) {
            if a == b {
                artifacts += 1;
                return Ok(());
            }
        }

        let claiming_work = match claiming_terminal.terminal() {
            Some(edition) => {
                terminal_work(store, redirects, edition, log, RESOLVED_BACKLINK_MISMATCHES)?
            }
            None => None,
        };
        let same_work = match (items.work_of(holding)?, claiming_work) {
            (Some(a), Some(b)) => bool_field(a == b),
            _ => "",
        };

        writer.write(&[
            holding,
            linked,
            linked_terminal.terminal().unwrap_or(""),
            claiming,
            claiming_terminal.terminal().unwrap_or(""),
            same_work,
        ])
    })?;

    let summary = writer.finish()?;
    println!("    Mismatches explained by redirects: {}", artifacts);
    Ok(summary)
}

fn resolved_links_missing_edition(
    store: &Store,
    config: &ReconcileConfig,
    redirects: &RedirectIndex,
    log: &mut ErrorLog,
) -> Result<ReportSummary> {
    let mut writer = ReportWriter::create(
        config,
        RESOLVED_LINKS_MISSING_EDITION,
        "Holdings whose linked edition still does not resolve to a live edition",
        &["holding_id", "linked_edition_id", "outcome", "terminal_id"],
    )?;
    let mut artifacts: u64 = 0;

    store.visit_rows(HOLDING_LINKS_MISSING_EDITION.sql, |row| {
        let holding = row[0].as_str();
        let linked = row[1].as_str();

        let (outcome, terminal) = match redirects.resolve(linked)? {
            Resolution::Resolved(terminal) if store.is_live(&terminal)? => {
                artifacts += 1;
                return Ok(());
            }
            Resolution::Resolved(terminal) => {
                if terminal != linked {
                    log.append(
                        RESOLVED_LINKS_MISSING_EDITION,
                        &format!(
                            "terminal edition {} of {} is missing from the store",
                            terminal, linked
                        ),
                    )?;
                }
                ("missing", terminal)
            }
            Resolution::Dangling(target) => ("dangling", target),
            Resolution::Cyclic => ("cyclic", String::new()),
        };

        writer.write(&[holding, linked, outcome, terminal.as_str()])
    })?;

    let summary = writer.finish()?;
    println!("    Links repaired by redirects: {}", artifacts);
    Ok(summary)
}
