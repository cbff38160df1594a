//! Normalized SQLite store for parsed catalog and holdings records.
//!
//! Loads run in bounded transactions. A failing batch rolls back alone: batches committed
//! before it stay in the store, so a failed load leaves a partial table that must be
//! reloaded from scratch.

use crate::models::{CatalogRecord, Edition, HoldingItem};
use crate::stats::LoadStats;
use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use rustc_hash::FxHashSet;
use std::path::Path;
use tracing::{debug, info};

const CATALOG_SCHEMA: &str = r#"
    DROP TABLE IF EXISTS editions;
    DROP TABLE IF EXISTS edition_works;
    DROP TABLE IF EXISTS works;
    DROP TABLE IF EXISTS redirects;

    CREATE TABLE editions (
        edition_id TEXT PRIMARY KEY,
        work_id TEXT,
        holding_id TEXT,
        has_multiple_works INTEGER NOT NULL,
        has_source_record INTEGER NOT NULL
    );

    -- Every work an edition lists, in dump order
    CREATE TABLE edition_works (
        edition_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        work_id TEXT NOT NULL,
        PRIMARY KEY (edition_id, position)
    );

    CREATE TABLE works (work_id TEXT PRIMARY KEY);

    CREATE TABLE redirects (
        origin_id TEXT PRIMARY KEY,
        destination_id TEXT NOT NULL
    );
"#;

const HOLDINGS_SCHEMA: &str = r#"
    DROP TABLE IF EXISTS holdings;

    CREATE TABLE holdings (
        holding_id TEXT PRIMARY KEY,
        linked_edition_id TEXT,
        linked_work_id TEXT,
        isbn13 TEXT,
        sole_isbn13 INTEGER NOT NULL
    );
"#;

// Secondary indices are built after the bulk insert.
const CATALOG_INDICES: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_editions_work ON editions(work_id);
    CREATE INDEX IF NOT EXISTS idx_editions_holding ON editions(holding_id);
    CREATE INDEX IF NOT EXISTS idx_edition_works_work ON edition_works(work_id);
"#;

const HOLDINGS_INDICES: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_holdings_linked_edition ON holdings(linked_edition_id);
    CREATE INDEX IF NOT EXISTS idx_holdings_linked_work ON holdings(linked_work_id);
"#;

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to set store pragmas")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("Failed to open in-memory store")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        if !store.table_exists("editions")? {
            store.conn.execute_batch(CATALOG_SCHEMA)?;
        }
        if !store.table_exists("holdings")? {
            store.conn.execute_batch(HOLDINGS_SCHEMA)?;
        }
        Ok(store)
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Drops every catalog table; a reparse replaces the full prior set.
    pub fn reset_catalog(&self) -> Result<()> {
        self.conn
            .execute_batch(CATALOG_SCHEMA)
            .context("Failed to reset catalog tables")
    }

    pub fn reset_holdings(&self) -> Result<()> {
        self.conn
            .execute_batch(HOLDINGS_SCHEMA)
            .context("Failed to reset holdings table")
    }

    /// Replaces the catalog tables with `records`, committing every `batch_size` records.
    pub fn load_catalog<I>(&mut self, records: I, batch_size: usize) -> Result<LoadStats>
    where
        I: IntoIterator<Item = CatalogRecord>,
    {
        self.reset_catalog()?;
        self.insert_catalog(records, batch_size)
    }

    fn insert_catalog<I>(&mut self, records: I, batch_size: usize) -> Result<LoadStats>
    where
        I: IntoIterator<Item = CatalogRecord>,
    {
        let mut stats = LoadStats::default();
        let mut records = records.into_iter().peekable();

        while records.peek().is_some() {
            let committed = stats.records();
            let tx = self.conn.transaction()?;
            let batch = write_catalog_batch(&tx, records.by_ref().take(batch_size))
                .and_then(|batch| tx.commit().map(|_| batch))
                .with_context(|| {
                    format!(
                        "Catalog batch {} rolled back; {} records from earlier batches remain committed",
                        stats.batches + 1,
                        committed
                    )
                })?;

            stats.editions += batch.editions;
            stats.redirects += batch.redirects;
            stats.works += batch.works;
            stats.batches += 1;
            debug!(batch = stats.batches, records = stats.records(), "Catalog batch committed");
        }

        self.conn
            .execute_batch(CATALOG_INDICES)
            .context("Failed to index catalog tables")?;
        info!(
            editions = stats.editions,
            redirects = stats.redirects,
            works = stats.works,
            batches = stats.batches,
            "Catalog loaded"
        );
        Ok(stats)
    }

    pub fn load_holdings<I>(&mut self, items: I, batch_size: usize) -> Result<LoadStats>
    where
        I: IntoIterator<Item = HoldingItem>,
    {
        self.reset_holdings()?;
        self.insert_holdings(items, batch_size)
    }

    fn insert_holdings<I>(&mut self, items: I, batch_size: usize) -> Result<LoadStats>
    where
        I: IntoIterator<Item = HoldingItem>,
    {
        let mut stats = LoadStats::default();
        let mut items = items.into_iter().peekable();

        while items.peek().is_some() {
            let committed = stats.holdings;
            let tx = self.conn.transaction()?;
            let written = write_holdings_batch(&tx, items.by_ref().take(batch_size))
                .and_then(|written| tx.commit().map(|_| written))
                .with_context(|| {
                    format!(
                        "Holdings batch {} rolled back; {} records from earlier batches remain committed",
                        stats.batches + 1,
                        committed
                    )
                })?;

            stats.holdings += written;
            stats.batches += 1;
        }

        self.conn
            .execute_batch(HOLDINGS_INDICES)
            .context("Failed to index holdings table")?;
        info!(holdings = stats.holdings, batches = stats.batches, "Holdings loaded");
        Ok(stats)
    }

    pub fn edition(&self, edition_id: &str) -> Result<Option<Edition>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT edition_id, holding_id, has_source_record FROM editions WHERE edition_id = ?1",
        )?;
        let row = stmt
            .query_row(params![edition_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })
            .optional()?;

        let Some((edition_id, holding_id, has_source_record)) = row else {
            return Ok(None);
        };
        let work_ids = self.work_ids(&edition_id)?;
        Ok(Some(Edition {
            edition_id,
            work_ids,
            holding_id,
            has_source_record,
        }))
    }

    pub fn work_ids(&self, edition_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT work_id FROM edition_works WHERE edition_id = ?1 ORDER BY position",
        )?;
        let ids = stmt
            .query_map(params![edition_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn holding(&self, holding_id: &str) -> Result<Option<HoldingItem>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT holding_id, linked_edition_id, linked_work_id, isbn13, sole_isbn13 FROM holdings WHERE holding_id = ?1",
        )?;
        let item = stmt
            .query_row(params![holding_id], |row| {
                Ok(HoldingItem {
                    holding_id: row.get(0)?,
                    linked_edition_id: row.get(1)?,
                    linked_work_id: row.get(2)?,
                    isbn13: row.get(3)?,
                    sole_isbn13: row.get(4)?,
                })
            })
            .optional()?;
        Ok(item)
    }

    pub fn redirect_target(&self, origin_id: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT destination_id FROM redirects WHERE origin_id = ?1")?;
        Ok(stmt.query_row(params![origin_id], |row| row.get(0)).optional()?)
    }

    /// An id is live when it names a loaded edition or work.
    pub fn is_live(&self, id: &str) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT 1 FROM editions WHERE edition_id = ?1 UNION ALL SELECT 1 FROM works WHERE work_id = ?1 LIMIT 1",
        )?;
        Ok(stmt.exists(params![id])?)
    }

    /// Primary (first listed) work of an edition.
    pub fn work_of(&self, edition_id: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT work_id FROM editions WHERE edition_id = ?1")?;
        let work: Option<Option<String>> = stmt
            .query_row(params![edition_id], |row| row.get(0))
            .optional()?;
        Ok(work.flatten())
    }

    pub fn count(&self, table: Table) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn visit_redirects<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(String, String) -> Result<()>,
    {
        let mut stmt = self
            .conn
            .prepare("SELECT origin_id, destination_id FROM redirects")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            visit(row.get(0)?, row.get(1)?)?;
        }
        Ok(())
    }

    /// Holdings that name a catalog edition, ordered by holding id.
    pub fn visit_linked_holdings<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, &str) -> Result<()>,
    {
        let mut stmt = self.conn.prepare(
            "SELECT holding_id, linked_edition_id FROM holdings WHERE linked_edition_id IS NOT NULL ORDER BY holding_id",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let holding: String = row.get(0)?;
            let edition: String = row.get(1)?;
            visit(&holding, &edition)?;
        }
        Ok(())
    }

    pub fn count_unlinked_holdings(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM holdings WHERE linked_edition_id IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Holding ids claimed by more than one edition.
    pub fn multiply_claimed_holdings(&self) -> Result<FxHashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT holding_id FROM editions WHERE holding_id IS NOT NULL GROUP BY holding_id HAVING COUNT(*) > 1",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<FxHashSet<String>>>()?;
        Ok(ids)
    }

    /// Runs one of the fixed report queries, handing each row to `visit` as text.
    /// NULL becomes an empty string.
    pub(crate) fn visit_rows<F>(&self, query: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&[String]) -> Result<()>,
    {
        let mut stmt = self.conn.prepare(query)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query([])?;
        let mut values: Vec<String> = Vec::with_capacity(columns);

        while let Some(row) = rows.next()? {
            values.clear();
            for i in 0..columns {
                values.push(match row.get_ref(i)? {
                    ValueRef::Null => String::new(),
                    ValueRef::Integer(n) => n.to_string(),
                    ValueRef::Real(f) => f.to_string(),
                    ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
                });
            }
            visit(&values)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Editions,
    Works,
    Redirects,
    Holdings,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Editions => "editions",
            Table::Works => "works",
            Table::Redirects => "redirects",
            Table::Holdings => "holdings",
        }
    }
}

fn write_catalog_batch<I>(tx: &Transaction<'_>, records: I) -> rusqlite::Result<LoadStats>
where
    I: Iterator<Item = CatalogRecord>,
{
    let mut insert_edition = tx.prepare_cached(
        "INSERT OR REPLACE INTO editions VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut clear_works =
        tx.prepare_cached("DELETE FROM edition_works WHERE edition_id = ?1")?;
    let mut insert_work_link =
        tx.prepare_cached("INSERT OR REPLACE INTO edition_works VALUES (?1, ?2, ?3)")?;
    let mut insert_work = tx.prepare_cached("INSERT OR IGNORE INTO works VALUES (?1)")?;
    let mut insert_redirect =
        tx.prepare_cached("INSERT OR REPLACE INTO redirects VALUES (?1, ?2)")?;

    let mut stats = LoadStats::default();
    for record in records {
        match record {
            CatalogRecord::Edition(edition) => {
                insert_edition.execute(params![
                    edition.edition_id,
                    edition.work_id(),
                    edition.holding_id,
                    edition.has_multiple_works(),
                    edition.has_source_record,
                ])?;
                clear_works.execute(params![edition.edition_id])?;
                for (position, work_id) in edition.work_ids.iter().enumerate() {
                    insert_work_link.execute(params![
                        edition.edition_id,
                        position as i64,
                        work_id
                    ])?;
                }
                stats.editions += 1;
            }
            CatalogRecord::Redirect(redirect) => {
                insert_redirect.execute(params![redirect.origin_id, redirect.destination_id])?;
                stats.redirects += 1;
            }
            CatalogRecord::Work(work_id) => {
                insert_work.execute(params![work_id])?;
                stats.works += 1;
            }
        }
    }
    Ok(stats)
}

fn write_holdings_batch<I>(tx: &Transaction<'_>, items: I) -> rusqlite::Result<u64>
where
    I: Iterator<Item = HoldingItem>,
{
    let mut insert =
        tx.prepare_cached("INSERT OR REPLACE INTO holdings VALUES (?1, ?2, ?3, ?4, ?5)")?;
    let mut written = 0;
    for item in items {
        insert.execute(params![
            item.holding_id,
            item.linked_edition_id,
            item.linked_work_id,
            item.isbn13,
            item.sole_isbn13
        ])?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Redirect;
    use tempfile::TempDir;

    fn edition(id: &str, works: &[&str], holding: Option<&str>, source: bool) -> CatalogRecord {
        CatalogRecord::Edition(Edition {
            edition_id: id.into(),
            work_ids: works.iter().map(|w| w.to_string()).collect(),
            holding_id: holding.map(str::to_string),
            has_source_record: source,
        })
    }

    fn holding(id: &str, edition: Option<&str>) -> HoldingItem {
        HoldingItem {
            holding_id: id.into(),
            linked_edition_id: edition.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn edition_round_trip() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let original = Edition {
            edition_id: "OL1M".into(),
            work_ids: vec!["OL1W".into(), "OL2W".into()],
            holding_id: Some("item1".into()),
            has_source_record: true,
        };
        store.load_catalog(vec![CatalogRecord::Edition(original.clone())], 10)?;

        assert_eq!(store.edition("OL1M")?, Some(original));
        assert_eq!(store.edition("OL404M")?, None);
        assert_eq!(store.work_of("OL1M")?.as_deref(), Some("OL1W"));
        Ok(())
    }

    #[test]
    fn load_counts_batches() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let records = vec![
            edition("OL1M", &["OL1W"], None, false),
            edition("OL2M", &["OL1W"], None, false),
            CatalogRecord::Redirect(Redirect {
                origin_id: "OL3M".into(),
                destination_id: "OL1M".into(),
            }),
            CatalogRecord::Work("OL1W".into()),
            CatalogRecord::Work("OL1W".into()),
        ];
        let stats = store.load_catalog(records, 2)?;

        assert_eq!(stats.editions, 2);
        assert_eq!(stats.redirects, 1);
        assert_eq!(stats.works, 2);
        assert_eq!(stats.batches, 3);
        assert_eq!(store.count(Table::Editions)?, 2);
        assert_eq!(store.count(Table::Works)?, 1);
        assert_eq!(store.redirect_target("OL3M")?.as_deref(), Some("OL1M"));
        Ok(())
    }

    #[test]
    fn reload_replaces_previous_set() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        store.load_catalog(vec![edition("OL1M", &[], None, false)], 10)?;
        store.load_catalog(vec![edition("OL2M", &[], None, false)], 10)?;

        assert_eq!(store.edition("OL1M")?, None);
        assert!(store.edition("OL2M")?.is_some());
        assert_eq!(store.count(Table::Editions)?, 1);
        Ok(())
    }

    #[test]
    fn duplicate_edition_last_wins() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        store.load_catalog(
            vec![
                edition("OL1M", &["OL1W", "OL2W"], None, false),
                edition("OL1M", &["OL3W"], Some("item"), true),
            ],
            10,
        )?;

        let stored = store.edition("OL1M")?.unwrap();
        assert_eq!(stored.work_ids, vec!["OL3W"]);
        assert_eq!(stored.holding_id.as_deref(), Some("item"));
        Ok(())
    }

    #[test]
    fn holdings_round_trip() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let item = HoldingItem {
            holding_id: "item1".into(),
            linked_edition_id: Some("OL1M".into()),
            linked_work_id: Some("OL1W".into()),
            isbn13: Some("9780201570519".into()),
            sole_isbn13: true,
        };
        let stats = store.load_holdings(vec![item.clone(), holding("item2", None)], 1)?;

        assert_eq!(stats.holdings, 2);
        assert_eq!(stats.batches, 2);
        assert_eq!(store.holding("item1")?, Some(item));
        assert_eq!(store.count_unlinked_holdings()?, 1);
        Ok(())
    }

    #[test]
    fn failed_batch_rolls_back_alone() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        store.reset_catalog()?;
        store.conn.execute_batch(
            "CREATE TRIGGER reject_ol5m BEFORE INSERT ON editions
             WHEN NEW.edition_id = 'OL5M'
             BEGIN SELECT RAISE(ABORT, 'edition OL5M rejected'); END;",
        )?;

        let records = vec![
            edition("OL1M", &["OL1W"], None, false),
            edition("OL2M", &["OL2W"], None, false),
            edition("OL3M", &["OL3W"], None, false),
            edition("OL4M", &["OL4W"], None, false),
            edition("OL6M", &["OL6W"], None, false),
            edition("OL5M", &["OL5W"], None, false),
            edition("OL7M", &["OL7W"], None, false),
        ];
        let err = store.insert_catalog(records, 2).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Catalog batch 3 rolled back"));
        assert!(message.contains("4 records from earlier batches remain committed"));
        assert!(message.contains("edition OL5M rejected"));

        assert_eq!(store.count(Table::Editions)?, 4);
        assert!(store.edition("OL4M")?.is_some());
        // OL6M was written earlier in the failing batch
        assert_eq!(store.edition("OL6M")?, None);
        assert_eq!(store.work_ids("OL6M")?, Vec::<String>::new());
        assert_eq!(store.edition("OL7M")?, None);
        Ok(())
    }

    #[test]
    fn failed_holdings_batch_keeps_earlier_batches() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        store.reset_holdings()?;
        store.conn.execute_batch(
            "CREATE TRIGGER reject_bad_item BEFORE INSERT ON holdings
             WHEN NEW.holding_id = 'bad_item'
             BEGIN SELECT RAISE(ABORT, 'holding bad_item rejected'); END;",
        )?;

        let items = vec![
            holding("item1", Some("OL1M")),
            holding("item2", None),
            holding("bad_item", None),
        ];
        let err = store.insert_holdings(items, 2).unwrap_err();
        assert!(format!("{:#}", err).contains("Holdings batch 2 rolled back; 2 records"));
        assert_eq!(store.count(Table::Holdings)?, 2);
        assert!(store.holding("item2")?.is_some());
        Ok(())
    }

    #[test]
    fn liveness_covers_editions_and_works() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        store.load_catalog(
            vec![edition("OL1M", &[], None, false), CatalogRecord::Work("OL9W".into())],
            10,
        )?;
        assert!(store.is_live("OL1M")?);
        assert!(store.is_live("OL9W")?);
        assert!(!store.is_live("OL2M")?);
        Ok(())
    }

    #[test]
    fn multiply_claimed_holdings_found() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        store.load_catalog(
            vec![
                edition("OL1M", &[], Some("shared"), false),
                edition("OL2M", &[], Some("shared"), false),
                edition("OL3M", &[], Some("single"), false),
            ],
            10,
        )?;
        let claimed = store.multiply_claimed_holdings()?;
        assert_eq!(claimed.len(), 1);
        assert!(claimed.contains("shared"));
        Ok(())
    }

    #[test]
    fn visit_rows_renders_nulls_and_integers() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        store.load_catalog(vec![edition("OL1M", &[], None, true)], 10)?;

        let mut rows = Vec::new();
        store.visit_rows(
            "SELECT edition_id, holding_id, has_source_record FROM editions",
            |row| {
                rows.push(row.to_vec());
                Ok(())
            },
        )?;
        assert_eq!(rows, vec![vec!["OL1M".to_string(), String::new(), "1".to_string()]]);
        Ok(())
    }

    #[test]
    fn reopened_store_keeps_data() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("store.sqlite");
        {
            let mut store = Store::open(&path)?;
            store.load_catalog(vec![edition("OL1M", &["OL1W"], None, false)], 10)?;
        }
        let store = Store::open(&path)?;
        assert!(store.edition("OL1M")?.is_some());
        Ok(())
    }
}
