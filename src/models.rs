/// One catalog edition as parsed from a `/type/edition` dump line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edition {
    pub edition_id: String,
    /// Every work the edition lists, in dump order
    pub work_ids: Vec<String>,
    /// Claimed link to a digitized holding
    pub holding_id: Option<String>,
    /// Whether `source_records` carries a holdings-dataset provenance entry
    pub has_source_record: bool,
}

impl Edition {
    pub fn work_id(&self) -> Option<&str> {
        self.work_ids.first().map(String::as_str)
    }

    pub fn has_multiple_works(&self) -> bool {
        self.work_ids.len() > 1
    }
}

/// `origin_id` is superseded by `destination_id`. The destination may itself redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub origin_id: String,
    pub destination_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRecord {
    Edition(Edition),
    Redirect(Redirect),
    Work(String),
}

/// One digitized item from the holdings dump.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HoldingItem {
    pub holding_id: String,
    pub linked_edition_id: Option<String>,
    pub linked_work_id: Option<String>,
    pub isbn13: Option<String>,
    /// The listed ISBNs reduce to exactly one distinct ISBN-13
    pub sole_isbn13: bool,
}

/// Outcome of following a redirect chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resolution {
    Resolved(String),
    /// The chain ends at an identifier that is neither a redirect nor a live record
    Dangling(String),
    Cyclic,
}

impl Resolution {
    pub fn terminal(&self) -> Option<&str> {
        match self {
            Resolution::Resolved(id) => Some(id),
            _ => None,
        }
    }
}
