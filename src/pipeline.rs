//! Batch phases: parse and load both dumps, resolve redirects, write reports.
//!
//! Each phase reopens what it needs from the paths in [`ReconcileConfig`] and returns a
//! summary. A failing phase returns its error and leaves earlier outputs in place.

use crate::catalog::CatalogReader;
use crate::config::{ReconcileConfig, PROGRESS_INTERVAL};
use crate::error_log::ErrorLog;
use crate::holdings::{HoldingsFormat, HoldingsReader};
use crate::index::{indices_present, remove_index};
use crate::parser::open_dump;
use crate::reports::{self, ReportSummary};
use crate::resolver::build_indices;
use crate::stats::{LoadStats, ParseStats, ResolveStats};
use crate::store::{Store, Table};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CreateDbSummary {
    pub catalog: ParseStats,
    pub holdings: ParseStats,
    pub catalog_load: LoadStats,
    pub holdings_load: LoadStats,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolveSummary {
    pub stats: ResolveStats,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct ReportsSummary {
    pub reports: Vec<ReportSummary>,
    /// Entries this run appended to the error log
    pub errors_logged: u64,
    /// Post-resolution reports were requested but no resolver indices were on disk
    pub resolved_skipped: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub create_db: CreateDbSummary,
    pub resolve: Option<ResolveSummary>,
    pub reports: ReportsSummary,
}

fn make_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(msg.to_string());
    pb
}

/// Parses both dumps and replaces the store contents with them. Resolver indices built
/// from the previous load are deleted first.
pub fn create_db(config: &ReconcileConfig) -> Result<CreateDbSummary> {
    let start = Instant::now();
    for path in [&config.redirect_index_path, &config.item_map_path] {
        if remove_index(path)? {
            info!(path = %path.display(), "Removed index from previous load");
        }
    }
    let mut store = Store::open(&config.store_path)?;

    info!(path = %config.catalog_dump.display(), "Loading catalog dump");
    let reader = open_dump(&config.catalog_dump).context("Cannot read catalog dump")?;
    let mut records = CatalogReader::new(reader);
    let pb = make_spinner("Loading catalog");
    let mut seen: u64 = 0;
    let catalog_load = store.load_catalog(
        records.by_ref().inspect(|_| {
            seen += 1;
            if seen % PROGRESS_INTERVAL == 0 {
                pb.set_message(format!("Loading catalog: {} records", seen));
            }
        }),
        config.batch_size,
    )?;
    pb.finish_and_clear();
    let catalog = records.finish()?;

    info!(path = %config.holdings_dump.display(), "Loading holdings dump");
    let format = HoldingsFormat::detect(&config.holdings_dump);
    let reader = open_dump(&config.holdings_dump).context("Cannot read holdings dump")?;
    let mut items = HoldingsReader::new(reader, format);
    let pb = make_spinner("Loading holdings");
    let mut seen: u64 = 0;
    let holdings_load = store.load_holdings(
        items.by_ref().inspect(|_| {
            seen += 1;
            if seen % PROGRESS_INTERVAL == 0 {
                pb.set_message(format!("Loading holdings: {} records", seen));
            }
        }),
        config.batch_size,
    )?;
    pb.finish_and_clear();
    let holdings = items.finish()?;

    Ok(CreateDbSummary {
        catalog,
        holdings,
        catalog_load,
        holdings_load,
        duration: start.elapsed(),
    })
}

/// Rebuilds the redirect index and the item map from the loaded store.
pub fn resolve_redirects(config: &ReconcileConfig) -> Result<ResolveSummary> {
    let start = Instant::now();
    let store = open_loaded_store(config)?;
    let stats = build_indices(&store, config)?;
    Ok(ResolveSummary {
        stats,
        duration: start.elapsed(),
    })
}

/// Writes every store report, plus the post-resolution reports when `config.resolve` is set
/// and the resolver indices exist.
pub fn all_reports(config: &ReconcileConfig) -> Result<ReportsSummary> {
    let start = Instant::now();
    let store = open_loaded_store(config)?;

    let resolved = config.resolve
        && indices_present(&config.redirect_index_path, &config.item_map_path);
    if config.resolve && !resolved {
        warn!("Resolver indices not found, skipping post-resolution reports (run resolve-redirects first)");
    }

    let mut log = ErrorLog::open(&config.error_log_path)?;
    let mut summaries = reports::store_reports(&store, config, &mut log)?;
    if resolved {
        summaries.extend(reports::resolved_reports(&store, config, &mut log)?);
    }
    log.flush()?;

    Ok(ReportsSummary {
        reports: summaries,
        errors_logged: log.entries(),
        resolved_skipped: config.resolve && !resolved,
        duration: start.elapsed(),
    })
}

/// All phases in order. Redirect resolution is skipped when `config.resolve` is off.
pub fn run(config: &ReconcileConfig) -> Result<RunSummary> {
    let create_db = create_db(config).context("create-db phase failed")?;
    let resolve = if config.resolve {
        Some(resolve_redirects(config).context("resolve-redirects phase failed")?)
    } else {
        None
    };
    let reports = all_reports(config).context("all-reports phase failed")?;
    Ok(RunSummary {
        create_db,
        resolve,
        reports,
    })
}

fn open_loaded_store(config: &ReconcileConfig) -> Result<Store> {
    if !config.store_path.exists() {
        anyhow::bail!(
            "Store not found: {} (run create-db first)",
            config.store_path.display()
        );
    }
    let store = Store::open(&config.store_path)?;
    info!(
        editions = store.count(Table::Editions)?,
        redirects = store.count(Table::Redirects)?,
        holdings = store.count(Table::Holdings)?,
        "Store opened"
    );
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reports_without_store_fail() {
        let dir = TempDir::new().unwrap();
        let config = ReconcileConfig::from_dirs(dir.path(), dir.path(), "ol.txt", "ia.jsonl");
        let err = all_reports(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("create-db"));
    }

    #[test]
    fn create_db_without_dump_fails() {
        let dir = TempDir::new().unwrap();
        let config = ReconcileConfig::from_dirs(
            dir.path(),
            dir.path(),
            dir.path().join("absent.txt"),
            dir.path().join("absent.jsonl"),
        );
        let err = create_db(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("catalog dump"));
    }
}
