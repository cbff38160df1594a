use crate::error::LineError;

/// Per-stream counters kept by the dump readers
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParseStats {
    pub lines: u64,
    pub records: u64,
    /// Well-formed lines of a record type the pipeline does not use
    pub ignored: u64,
    pub bad_columns: u64,
    pub invalid_utf8: u64,
    pub invalid_json: u64,
    pub missing_field: u64,
}

impl ParseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_skip(&mut self, err: &LineError) {
        match err {
            LineError::ColumnCount { .. } => self.bad_columns += 1,
            LineError::InvalidUtf8 => self.invalid_utf8 += 1,
            LineError::InvalidJson => self.invalid_json += 1,
            LineError::MissingField(_) => self.missing_field += 1,
        }
    }

    pub fn skipped(&self) -> u64 {
        self.bad_columns + self.invalid_utf8 + self.invalid_json + self.missing_field
    }
}

/// Outcome of a batched load into the store
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadStats {
    pub editions: u64,
    pub redirects: u64,
    pub works: u64,
    pub holdings: u64,
    pub batches: u64,
}

impl LoadStats {
    pub fn records(&self) -> u64 {
        self.editions + self.redirects + self.works + self.holdings
    }
}

/// Counters for one redirect resolution run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolveStats {
    pub redirects: u64,
    pub resolved: u64,
    pub dangling: u64,
    pub cyclic: u64,
    /// Distinct cycles found while walking chains
    pub cycles_detected: u64,
    pub holdings_mapped: u64,
    pub holdings_unlinked: u64,
    pub holdings_unresolved: u64,
    pub holdings_without_work: u64,
}

impl ResolveStats {
    pub fn unresolved(&self) -> u64 {
        self.dangling + self.cyclic
    }
}
