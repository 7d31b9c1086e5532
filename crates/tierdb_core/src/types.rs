//! Core type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique, monotonically increasing segment identifier.
///
/// Id 0 is reserved for the empty disk segment that stands in when no disk
/// segment has been produced yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// The id of the empty disk segment.
    pub const EMPTY: Self = Self(0);

    /// Creates a new segment id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation index ordering writes within and across segments.
///
/// Higher operation indexes are more recent writes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OpIndex(pub u64);

impl OpIndex {
    /// Creates a new operation index.
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op:{}", self.0)
    }
}

/// Thread-safe monotonic id source.
///
/// Used for segment ids and operation indexes. `next_id` never returns 0.
#[derive(Debug, Default)]
pub struct IdProvider {
    last: AtomicU64,
}

impl IdProvider {
    /// Creates a provider whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider whose next id is `last + 1`.
    #[must_use]
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the last id handed out (0 if none).
    #[must_use]
    pub fn last_id(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Makes sure the next id is greater than `seen`.
    pub fn advance_past(&self, seen: u64) {
        self.last.fetch_max(seen, Ordering::SeqCst);
    }
}
