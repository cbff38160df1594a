//! Persisted key-value indices produced by redirect resolution.
//!
//! Both indices are build artifacts: every resolution run deletes the previous file and
//! writes a fresh one. Identity mappings are implicit, so an id missing from the redirect
//! index is its own terminal.

use crate::models::Resolution;
use anyhow::{Context, Result};
use redb::{Database, ReadOnlyTable, ReadableTable, TableDefinition};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Redirect origin -> terminal id
const TERMINAL: TableDefinition<&str, &str> = TableDefinition::new("terminal");

/// Redirect origin -> dangling target, or empty for a cycle
const UNRESOLVED: TableDefinition<&str, &str> = TableDefinition::new("unresolved");

/// Holding id -> terminal work id
const HOLDING_WORK: TableDefinition<&str, &str> = TableDefinition::new("holding_work");

/// Deletes an index file. Returns whether one was there.
pub fn remove_index(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(path)
        .with_context(|| format!("Failed to remove stale index: {}", path.display()))?;
    Ok(true)
}

/// Whether both resolution indices are on disk.
pub fn indices_present(redirect_index: &Path, item_map: &Path) -> bool {
    redirect_index.exists() && item_map.exists()
}

fn recreate(path: &Path) -> Result<Database> {
    remove_index(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create index directory: {}", parent.display()))?;
    }
    Database::create(path).with_context(|| format!("Failed to create index: {}", path.display()))
}

fn open_existing(path: &Path) -> Result<Database> {
    if !path.exists() {
        anyhow::bail!(
            "Index not found: {} (run redirect resolution first)",
            path.display()
        );
    }
    Database::open(path).with_context(|| format!("Failed to open index: {}", path.display()))
}

fn write_pairs(
    db: &Database,
    table: TableDefinition<&str, &str>,
    pairs: &[(String, String)],
) -> Result<()> {
    let tx = db.begin_write()?;
    {
        let mut table = tx.open_table(table)?;
        for (key, value) in pairs {
            table.insert(key.as_str(), value.as_str())?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Buffers inserts and commits one write transaction per `batch_size` pairs.
struct PairBuffer {
    name: &'static str,
    table: TableDefinition<'static, &'static str, &'static str>,
    pending: Vec<(String, String)>,
    batch_size: usize,
    written: u64,
}

impl PairBuffer {
    fn new(
        name: &'static str,
        table: TableDefinition<'static, &'static str, &'static str>,
        batch_size: usize,
    ) -> Self {
        Self {
            name,
            table,
            pending: Vec::with_capacity(batch_size.min(100_000)),
            batch_size: batch_size.max(1),
            written: 0,
        }
    }

    fn push(&mut self, db: &Database, key: &str, value: &str) -> Result<()> {
        self.pending.push((key.to_string(), value.to_string()));
        if self.pending.len() >= self.batch_size {
            self.flush(db)?;
        }
        Ok(())
    }

    fn flush(&mut self, db: &Database) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        write_pairs(db, self.table, &self.pending)?;
        self.written += self.pending.len() as u64;
        debug!(table = self.name, written = self.written, "Index batch committed");
        self.pending.clear();
        Ok(())
    }
}

pub struct RedirectIndexWriter {
    db: Database,
    terminal: PairBuffer,
    unresolved: PairBuffer,
}

impl RedirectIndexWriter {
    pub fn create(path: &Path, batch_size: usize) -> Result<Self> {
        let db = recreate(path)?;
        // Create both tables up front so readers never see a missing table.
        write_pairs(&db, TERMINAL, &[])?;
        write_pairs(&db, UNRESOLVED, &[])?;
        Ok(Self {
            db,
            terminal: PairBuffer::new("terminal", TERMINAL, batch_size),
            unresolved: PairBuffer::new("unresolved", UNRESOLVED, batch_size),
        })
    }

    pub fn insert(&mut self, origin: &str, resolution: &Resolution) -> Result<()> {
        match resolution {
            Resolution::Resolved(terminal) => self.terminal.push(&self.db, origin, terminal),
            Resolution::Dangling(target) => self.unresolved.push(&self.db, origin, target),
            Resolution::Cyclic => self.unresolved.push(&self.db, origin, ""),
        }
    }

    /// Flushes pending writes; returns (terminal, unresolved) entry counts.
    pub fn finish(mut self) -> Result<(u64, u64)> {
        self.terminal.flush(&self.db)?;
        self.unresolved.flush(&self.db)?;
        Ok((self.terminal.written, self.unresolved.written))
    }
}

pub struct ItemMapWriter {
    db: Database,
    holding_work: PairBuffer,
}

impl ItemMapWriter {
    pub fn create(path: &Path, batch_size: usize) -> Result<Self> {
        let db = recreate(path)?;
        write_pairs(&db, HOLDING_WORK, &[])?;
        Ok(Self {
            db,
            holding_work: PairBuffer::new("holding_work", HOLDING_WORK, batch_size),
        })
    }

    pub fn insert(&mut self, holding_id: &str, work_id: &str) -> Result<()> {
        self.holding_work.push(&self.db, holding_id, work_id)
    }

    pub fn finish(mut self) -> Result<u64> {
        self.holding_work.flush(&self.db)?;
        Ok(self.holding_work.written)
    }
}

/// Read side of the redirect-resolution index.
pub struct RedirectIndex {
    terminal: ReadOnlyTable<&'static str, &'static str>,
    unresolved: ReadOnlyTable<&'static str, &'static str>,
    _db: Database,
}

impl RedirectIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let db = open_existing(path)?;
        let tx = db.begin_read()?;
        let terminal = tx.open_table(TERMINAL)?;
        let unresolved = tx.open_table(UNRESOLVED)?;
        Ok(Self {
            terminal,
            unresolved,
            _db: db,
        })
    }

    pub fn resolve(&self, id: &str) -> Result<Resolution> {
        if let Some(terminal) = self.terminal.get(id)? {
            return Ok(Resolution::Resolved(terminal.value().to_string()));
        }
        if let Some(target) = self.unresolved.get(id)? {
            let target = target.value();
            return Ok(if target.is_empty() {
                Resolution::Cyclic
            } else {
                Resolution::Dangling(target.to_string())
            });
        }
        Ok(Resolution::Resolved(id.to_string()))
    }
}

/// Read side of the holding -> terminal work index.
pub struct ItemMapIndex {
    holding_work: ReadOnlyTable<&'static str, &'static str>,
    _db: Database,
}

impl ItemMapIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let db = open_existing(path)?;
        let tx = db.begin_read()?;
        let holding_work = tx.open_table(HOLDING_WORK)?;
        Ok(Self {
            holding_work,
            _db: db,
        })
    }

    pub fn work_of(&self, holding_id: &str) -> Result<Option<String>> {
        Ok(self
            .holding_work
            .get(holding_id)?
            .map(|work| work.value().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn redirect_index_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("redirects.redb");

        let mut writer = RedirectIndexWriter::create(&path, 2)?;
        writer.insert("A", &Resolution::Resolved("C".into()))?;
        writer.insert("B", &Resolution::Resolved("C".into()))?;
        writer.insert("X", &Resolution::Dangling("Y".into()))?;
        writer.insert("P", &Resolution::Cyclic)?;
        assert_eq!(writer.finish()?, (2, 2));

        let index = RedirectIndex::open(&path)?;
        assert_eq!(index.resolve("A")?, Resolution::Resolved("C".into()));
        assert_eq!(index.resolve("X")?, Resolution::Dangling("Y".into()));
        assert_eq!(index.resolve("P")?, Resolution::Cyclic);
        assert_eq!(index.resolve("C")?, Resolution::Resolved("C".into()));
        Ok(())
    }

    #[test]
    fn rebuild_discards_previous_entries() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("item_map.redb");

        let mut writer = ItemMapWriter::create(&path, 10)?;
        writer.insert("item1", "W1")?;
        writer.finish()?;

        let mut writer = ItemMapWriter::create(&path, 10)?;
        writer.insert("item2", "W2")?;
        assert_eq!(writer.finish()?, 1);

        let index = ItemMapIndex::open(&path)?;
        assert_eq!(index.work_of("item1")?, None);
        assert_eq!(index.work_of("item2")?.as_deref(), Some("W2"));
        Ok(())
    }

    #[test]
    fn empty_index_is_readable() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("empty.redb");
        RedirectIndexWriter::create(&path, 10)?.finish()?;

        let index = RedirectIndex::open(&path)?;
        assert_eq!(index.resolve("OL1M")?, Resolution::Resolved("OL1M".into()));
        Ok(())
    }

    #[test]
    fn removed_index_is_gone() -> Result<()> {
        let dir = TempDir::new()?;
        let redirects = dir.path().join("redirects.redb");
        let items = dir.path().join("item_map.redb");
        RedirectIndexWriter::create(&redirects, 10)?.finish()?;
        ItemMapWriter::create(&items, 10)?.finish()?;
        assert!(indices_present(&redirects, &items));

        assert!(remove_index(&items)?);
        assert!(!remove_index(&items)?);
        assert!(!indices_present(&redirects, &items));
        assert!(ItemMapIndex::open(&items).is_err());
        Ok(())
    }

    #[test]
    fn missing_index_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(ItemMapIndex::open(&dir.path().join("absent.redb")).is_err());
    }
}
