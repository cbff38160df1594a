use std::path::{Path, PathBuf};

/// Records per load transaction and per index write batch
pub const DEFAULT_BATCH_SIZE: usize = 50_000;

/// Progress update interval (tick every N records)
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Prefix marking a holdings-dataset provenance entry in `source_records`
pub const HOLDING_SOURCE_PREFIX: &str = "ia:";

pub const STORE_FILE: &str = "reconcile.sqlite";
pub const REDIRECT_INDEX_FILE: &str = "redirects.redb";
pub const ITEM_MAP_FILE: &str = "item_map.redb";
pub const ERROR_LOG_FILE: &str = "errors.log";

/// Run-scoped settings handed to every phase.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub catalog_dump: PathBuf,
    pub holdings_dump: PathBuf,
    pub store_path: PathBuf,
    pub redirect_index_path: PathBuf,
    pub item_map_path: PathBuf,
    pub reports_dir: PathBuf,
    pub error_log_path: PathBuf,
    pub batch_size: usize,
    /// Run the redirect resolver and the post-resolution reports
    pub resolve: bool,
}

impl ReconcileConfig {
    /// Derives database and log locations from a working directory and a reports directory.
    pub fn from_dirs(
        files_dir: impl AsRef<Path>,
        reports_dir: impl AsRef<Path>,
        catalog_dump: impl Into<PathBuf>,
        holdings_dump: impl Into<PathBuf>,
    ) -> Self {
        let files_dir = files_dir.as_ref();
        let reports_dir = reports_dir.as_ref();
        Self {
            catalog_dump: catalog_dump.into(),
            holdings_dump: holdings_dump.into(),
            store_path: files_dir.join(STORE_FILE),
            redirect_index_path: files_dir.join(REDIRECT_INDEX_FILE),
            item_map_path: files_dir.join(ITEM_MAP_FILE),
            reports_dir: reports_dir.to_path_buf(),
            error_log_path: reports_dir.join(ERROR_LOG_FILE),
            batch_size: DEFAULT_BATCH_SIZE,
            resolve: true,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn report_path(&self, name: &str) -> PathBuf {
        self.reports_dir.join(format!("{}.tsv", name))
    }
}
