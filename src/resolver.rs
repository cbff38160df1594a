//! Redirect resolution.
//!
//! Every redirect chain is followed to its terminal id exactly once: results are memoized
//! for every id on the walked path, so shared tails cost nothing after the first walk. A
//! chain that revisits an id is cyclic; one that stops at an id with no live record is
//! dangling. Neither outcome aborts the run.

use crate::config::{ReconcileConfig, PROGRESS_INTERVAL};
use crate::index::{ItemMapWriter, RedirectIndexWriter};
use crate::models::Resolution;
use crate::stats::ResolveStats;
use crate::store::Store;
use anyhow::Result;
use indicatif::ProgressBar;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

/// What the resolver needs to know about records that are not redirects.
pub trait CatalogLookup {
    /// Whether an edition or work record exists under this id.
    fn is_live(&self, id: &str) -> Result<bool>;

    /// Primary work of an edition.
    fn work_of(&self, edition_id: &str) -> Result<Option<String>>;
}

impl CatalogLookup for Store {
    fn is_live(&self, id: &str) -> Result<bool> {
        Store::is_live(self, id)
    }

    fn work_of(&self, edition_id: &str) -> Result<Option<String>> {
        Store::work_of(self, edition_id)
    }
}

/// Origin -> destination edges of every stored redirect.
#[derive(Debug, Default)]
pub struct RedirectGraph {
    edges: FxHashMap<String, String>,
}

impl RedirectGraph {
    pub fn load(store: &Store) -> Result<Self> {
        let mut edges = FxHashMap::default();
        store.visit_redirects(|origin, destination| {
            edges.insert(origin, destination);
            Ok(())
        })?;
        info!(redirects = edges.len(), "Redirect graph loaded");
        Ok(Self { edges })
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            edges: pairs
                .into_iter()
                .map(|(origin, destination)| (origin.into(), destination.into()))
                .collect(),
        }
    }

    pub fn target(&self, id: &str) -> Option<&str> {
        self.edges.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Redirect origins in sorted order.
    pub fn origins(&self) -> Vec<&str> {
        let mut origins: Vec<&str> = self.edges.keys().map(String::as_str).collect();
        origins.sort_unstable();
        origins
    }
}

pub struct RedirectResolver<'a, C> {
    graph: &'a RedirectGraph,
    catalog: &'a C,
    memo: FxHashMap<String, Resolution>,
    stats: ResolveStats,
}

impl<'a, C: CatalogLookup> RedirectResolver<'a, C> {
    pub fn new(graph: &'a RedirectGraph, catalog: &'a C) -> Self {
        Self {
            graph,
            catalog,
            memo: FxHashMap::default(),
            stats: ResolveStats {
                redirects: graph.len() as u64,
                ..ResolveStats::default()
            },
        }
    }

    pub fn stats(&self) -> &ResolveStats {
        &self.stats
    }

    /// Resolves any id. Ids that are not redirect origins resolve to themselves when a live
    /// record backs them, and are dangling otherwise.
    pub fn resolve(&mut self, id: &str) -> Result<Resolution> {
        if let Some(known) = self.memo.get(id) {
            return Ok(known.clone());
        }

        let graph = self.graph;
        let mut current = id;
        let mut path: Vec<&str> = Vec::new();
        let mut visited: FxHashSet<&str> = FxHashSet::default();

        let outcome = loop {
            if let Some(known) = self.memo.get(current) {
                break known.clone();
            }
            if !visited.insert(current) {
                self.stats.cycles_detected += 1;
                warn!(origin = id, at = current, "Redirect cycle");
                break Resolution::Cyclic;
            }
            match graph.target(current) {
                Some(next) => {
                    path.push(current);
                    current = next;
                }
                None if self.catalog.is_live(current)? => {
                    break Resolution::Resolved(current.to_string());
                }
                None => {
                    debug!(origin = id, target = current, "Dangling redirect");
                    break Resolution::Dangling(current.to_string());
                }
            }
        };

        for origin in path {
            self.remember(origin, &outcome);
        }
        Ok(outcome)
    }

    fn remember(&mut self, origin: &str, outcome: &Resolution) {
        match outcome {
            Resolution::Resolved(_) => self.stats.resolved += 1,
            Resolution::Dangling(_) => self.stats.dangling += 1,
            Resolution::Cyclic => self.stats.cyclic += 1,
        }
        self.memo.insert(origin.to_string(), outcome.clone());
    }

    /// Resolves every redirect origin in the graph, ticking `pb` as it goes.
    pub fn resolve_all(&mut self, pb: &ProgressBar) -> Result<()> {
        let graph = self.graph;
        for (done, origin) in graph.origins().into_iter().enumerate() {
            if !self.memo.contains_key(origin) {
                self.resolve(origin)?;
            }
            if done as u64 % PROGRESS_INTERVAL == 0 {
                pb.tick();
            }
        }
        Ok(())
    }

    /// Results for every redirect origin, sorted by origin.
    pub fn resolutions(&self) -> Vec<(&str, &Resolution)> {
        let mut entries: Vec<(&str, &Resolution)> = self
            .memo
            .iter()
            .map(|(origin, outcome)| (origin.as_str(), outcome))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// A work id that is not a redirect origin is taken as-is; works are not required to
    /// appear in the catalog as records of their own.
    fn resolve_work(&mut self, work_id: &str) -> Result<Option<String>> {
        if self.graph.target(work_id).is_none() {
            return Ok(Some(work_id.to_string()));
        }
        Ok(self.resolve(work_id)?.terminal().map(str::to_string))
    }

    /// Terminal work for a holding that names `linked_edition_id`, or `None` when the edition
    /// does not resolve or its terminal edition carries no work.
    pub fn map_holding(&mut self, linked_edition_id: &str) -> Result<Option<String>> {
        let edition = match self.resolve(linked_edition_id)? {
            Resolution::Resolved(edition) => edition,
            _ => {
                self.stats.holdings_unresolved += 1;
                return Ok(None);
            }
        };
        let Some(work) = self.catalog.work_of(&edition)? else {
            self.stats.holdings_without_work += 1;
            return Ok(None);
        };
        match self.resolve_work(&work)? {
            Some(terminal) => {
                self.stats.holdings_mapped += 1;
                Ok(Some(terminal))
            }
            None => {
                self.stats.holdings_unresolved += 1;
                Ok(None)
            }
        }
    }

    pub fn into_stats(self) -> ResolveStats {
        self.stats
    }
}

/// Rebuilds the redirect index and the item map from the current store contents.
pub fn build_indices(store: &Store, config: &ReconcileConfig) -> Result<ResolveStats> {
    let graph = RedirectGraph::load(store)?;
    let mut resolver = RedirectResolver::new(&graph, store);
    let pb = ProgressBar::new_spinner();

    pb.set_message("Resolving redirects");
    resolver.resolve_all(&pb)?;

    let mut writer = RedirectIndexWriter::create(&config.redirect_index_path, config.batch_size)?;
    for (origin, outcome) in resolver.resolutions() {
        writer.insert(origin, outcome)?;
    }
    let (terminal, unresolved) = writer.finish()?;
    info!(
        terminal,
        unresolved,
        path = %config.redirect_index_path.display(),
        "Redirect index written"
    );

    pb.set_message("Mapping holdings to works");
    let mut item_map = ItemMapWriter::create(&config.item_map_path, config.batch_size)?;
    let mut seen: u64 = 0;
    store.visit_linked_holdings(|holding, edition| {
        if let Some(work) = resolver.map_holding(edition)? {
            item_map.insert(holding, &work)?;
        }
        seen += 1;
        if seen % PROGRESS_INTERVAL == 0 {
            pb.tick();
        }
        Ok(())
    })?;
    let mapped = item_map.finish()?;
    pb.finish_and_clear();

    let mut stats = resolver.into_stats();
    stats.holdings_unlinked = store.count_unlinked_holdings()?;

    info!(
        redirects = stats.redirects,
        resolved = stats.resolved,
        dangling = stats.dangling,
        cyclic = stats.cyclic,
        cycles = stats.cycles_detected,
        mapped,
        "Redirect resolution complete"
    );
    Ok(stats)
}
