use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Cumulative anomaly log shared by every phase. Opened in append mode and never truncated.
pub struct ErrorLog {
    path: PathBuf,
    writer: BufWriter<File>,
    entries: u64,
}

impl ErrorLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open error log: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            entries: 0,
        })
    }

    /// Appends `unix_seconds \t source \t message`. Tabs and newlines in the message are
    /// flattened to spaces so every entry stays on one line.
    pub fn append(&mut self, source: &str, message: &str) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let message = message.replace(['\t', '\n', '\r'], " ");
        writeln!(self.writer, "{}\t{}\t{}", now, source, message)
            .with_context(|| format!("Failed to write error log: {}", self.path.display()))?;
        self.entries += 1;
        warn!(source, "{}", message);
        Ok(())
    }

    /// Entries appended through this handle.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush error log: {}", self.path.display()))
    }
}

impl Drop for ErrorLog {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
