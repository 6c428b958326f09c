//! Approximate presence set for prune runs.
//!
//! During a prune-enabled listing, every listed item's service ID is
//! inserted; afterwards, any archived item whose ID is absent is deleted.
//! A Bloom filter guarantees no false negatives, so prune can never
//! delete an item the source actually listed; the low false-positive
//! rate only means an occasional orphan is kept.

use std::sync::Arc;

use bloomfilter::Bloom;
use parking_lot::Mutex;

/// Expected number of distinct item IDs in one listing.
const EXPECTED_ITEMS: usize = 10_000_000;

/// Acceptable false-positive rate ("claim present when it wasn't").
const FALSE_POSITIVE_RATE: f64 = 0.001;

/// A shared, insert-only approximate set of item IDs seen during a
/// listing.
pub struct PresenceFilter {
    bloom: Mutex<Bloom<String>>,
}

impl PresenceFilter {
    pub fn new() -> Self {
        PresenceFilter {
            bloom: Mutex::new(Bloom::new_for_fp_rate(EXPECTED_ITEMS, FALSE_POSITIVE_RATE)),
        }
    }

    /// A filter behind an `Arc`, for sharing across workers.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Record that the source listed this item ID.
    pub fn insert(&self, original_id: &str) {
        self.bloom.lock().set(&original_id.to_string());
    }

    /// Whether the ID was (probably) listed. Never returns false for an
    /// inserted ID.
    pub fn contains(&self, original_id: &str) -> bool {
        self.bloom.lock().check(&original_id.to_string())
    }
}

impl Default for PresenceFilter {
    fn default() -> Self {
        Self::new()
    }
}
