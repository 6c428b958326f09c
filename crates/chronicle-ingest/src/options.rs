//! Operation options: what to process, how to merge, and the timeframe.
//!
//! Every behavior switch of the pipeline is an explicit field here; no
//! hidden globals influence processing.

use std::fmt;

use chrono::{DateTime, Utc};

/// A start and end bound by time and/or by item ID, where any bound may
/// be absent (unbounded in that direction). When both a timestamp and an
/// item ID are set for the same side they are correlated and never in
/// conflict, so adapters may honor whichever they can.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeframe {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub since_item_id: Option<String>,
    pub until_item_id: Option<String>,
}

impl Timeframe {
    /// True when no bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.since.is_none()
            && self.until.is_none()
            && self.since_item_id.is_none()
            && self.until_item_id.is_none()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Stable rendering; checkpoint fingerprints depend on it.
        write!(
            f,
            "{{since:{} until:{} since_item:{} until_item:{}}}",
            self.since.map(|t| t.timestamp()).unwrap_or_default(),
            self.until.map(|t| t.timestamp()).unwrap_or_default(),
            self.since_item_id.as_deref().unwrap_or_default(),
            self.until_item_id.as_deref().unwrap_or_default(),
        )
    }
}

/// How items are combined when a soft merge finds an existing row.
///
/// By default a merge is additive: existing values win and incoming
/// values only fill gaps, so a merge never silently destroys data. The
/// `prefer_new_*` switches invert that per field (the incoming value
/// wins where it is non-null; a merge still never nulls a field).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Enable soft merging: an incoming item may be merged into an
    /// existing row with a different service ID when the timestamps are
    /// equal and the text, filename, or content hash matches. Useful
    /// when one service lists the same item under different IDs through
    /// different listing methods.
    pub soft: bool,

    /// Keep the incoming item's service ID instead of the existing
    /// row's.
    pub prefer_new_id: bool,

    /// Overwrite existing text content.
    pub prefer_new_data_text: bool,

    /// Overwrite the existing data file.
    pub prefer_new_data_file: bool,

    /// Overwrite existing metadata.
    pub prefer_new_metadata: bool,
}

/// Configures how an operation carries out item processing.
#[derive(Debug, Clone, Default)]
pub struct ProcessingOptions {
    /// Replace items already in the archive (unless locally modified).
    pub reprocess: bool,

    /// After a complete listing, delete items the source no longer
    /// lists.
    pub prune: bool,

    /// Rehash existing data files and reprocess items whose bytes no
    /// longer match the recorded hash.
    pub integrity: bool,

    /// Bounds on which items to list.
    pub timeframe: Timeframe,

    /// Soft-merge behavior.
    pub merge: MergeOptions,

    /// Verbose adapter output.
    pub verbose: bool,
}
