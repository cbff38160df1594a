use crate::error::LineError;
use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::MultiGzDecoder;
use memchr::memchr;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

const READ_BUFFER: usize = 256 * 1024;

/// Opens a dump for line-by-line reading, decompressing `.bz2` and `.gz` on the fly.
pub fn open_dump(path: &Path) -> Result<Box<dyn BufRead>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open dump: {}", path.display()))?;

    let reader: Box<dyn BufRead> = match path.extension().and_then(|e| e.to_str()) {
        Some("bz2") => Box::new(BufReader::with_capacity(READ_BUFFER, BzDecoder::new(file))),
        Some("gz") => Box::new(BufReader::with_capacity(
            READ_BUFFER,
            MultiGzDecoder::new(file),
        )),
        _ => Box::new(BufReader::with_capacity(READ_BUFFER, file)),
    };
    Ok(reader)
}

/// The extension of the dump itself, ignoring a trailing compression suffix.
pub fn dump_extension(path: &Path) -> Option<&str> {
    let ext = path.extension().and_then(|e| e.to_str())?;
    if matches!(ext, "bz2" | "gz") {
        Path::new(path.file_stem()?).extension()?.to_str()
    } else {
        Some(ext)
    }
}

/// Reuses one buffer for every line so memory stays flat regardless of dump size.
pub(crate) struct DumpLines<R> {
    reader: R,
    buf: Vec<u8>,
    error: Option<io::Error>,
}

impl<R: BufRead> DumpLines<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(16 * 1024),
            error: None,
        }
    }

    /// Next line without its terminator. `None` at end of stream or after a read error.
    pub(crate) fn next_line(&mut self) -> Option<&[u8]> {
        if self.error.is_some() {
            return None;
        }
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => Some(trim_line_end(&self.buf)),
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }

    pub(crate) fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Splits a tab-separated line into exactly `N` columns, or at least `N` when `exact` is false
/// (extra columns are dropped).
pub(crate) fn split_columns<const N: usize>(
    line: &[u8],
    exact: bool,
) -> Result<[&[u8]; N], LineError> {
    let mut cols: [&[u8]; N] = [&line[..0]; N];
    let mut found = 0;
    let mut start = 0;

    loop {
        let end = memchr(b'\t', &line[start..]).map(|p| start + p);
        if found < N {
            cols[found] = &line[start..end.unwrap_or(line.len())];
        }
        found += 1;
        match end {
            Some(pos) => start = pos + 1,
            None => break,
        }
    }

    if found < N || (exact && found != N) {
        return Err(LineError::ColumnCount { expected: N, found });
    }
    Ok(cols)
}

pub(crate) fn as_str(bytes: &[u8]) -> Result<&str, LineError> {
    std::str::from_utf8(bytes).map_err(|_| LineError::InvalidUtf8)
}

/// Last path segment of a key such as `/books/OL1M`; empty keys yield `None`.
pub fn key_id(key: &str) -> Option<&str> {
    let id = key.trim().rsplit('/').next()?.trim();
    (!id.is_empty()).then_some(id)
}
