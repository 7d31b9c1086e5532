//! In-memory segments and the tier queues.
//!
//! A segment moves through four tiers:
//!
//! ```text
//! Mutable -> ReadOnly -> Disk -> Bottom
//! ```
//!
//! The mutable segment accepts writes. Sealing freezes it and pushes it
//! onto the read-only queue; the read-only merge folds that queue into the
//! disk segment, and an oversized disk segment moves to the bottom queue.

mod mutable;
mod queue;

pub use mutable::{MutableSegment, UpsertOutcome};
pub use queue::SegmentQueue;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stage of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentTier {
    /// The segment currently accepting writes.
    Mutable,
    /// Sealed, in memory, waiting to be merged.
    ReadOnly,
    /// The merged on-disk segment.
    Disk,
    /// Disk segments that have moved below the disk tier.
    Bottom,
}

impl fmt::Display for SegmentTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mutable => "mutable",
            Self::ReadOnly => "read-only",
            Self::Disk => "disk",
            Self::Bottom => "bottom",
        };
        f.write_str(name)
    }
}
