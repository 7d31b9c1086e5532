//! The writable segment.

use super::SegmentTier;
use crate::category;
use crate::config::LogOptions;
use crate::error::CoreResult;
use crate::log::DurableLog;
use crate::map::{RecoverableMap, TombstonePolicy};
use crate::merge::SegmentEntry;
use crate::schema::Schema;
use crate::types::{IdProvider, OpIndex, SegmentId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tierdb_storage::StoreProvider;

/// Result of a write against a [`MutableSegment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The key was not present in this segment.
    Added,
    /// The key was present and its value replaced.
    Replaced,
    /// The segment was sealed; the write was not applied.
    Frozen,
}

/// An in-memory segment backed by its own durable log.
///
/// Tombstones are kept in memory and on replay so the segment shadows the
/// tiers below it. Once frozen the segment rejects writes and becomes a
/// read-only segment.
pub struct MutableSegment<S: Schema> {
    id: SegmentId,
    map: RecoverableMap<S>,
    ops: Arc<IdProvider>,
    // Write gate; true once frozen.
    frozen: Mutex<bool>,
}

impl<S: Schema> MutableSegment<S> {
    /// Opens the segment `id`, replaying its log if one exists.
    ///
    /// Operation indexes are drawn from `ops`, which is advanced past every
    /// index found in the log.
    pub fn open(
        provider: Arc<dyn StoreProvider>,
        id: SegmentId,
        ops: Arc<IdProvider>,
        options: LogOptions,
        frozen: bool,
    ) -> CoreResult<Self> {
        let log = DurableLog::open(provider, id, category::SEGMENT_LOG, options)?;
        let map = RecoverableMap::open(log, TombstonePolicy::Retain, options.tail_policy)?;
        ops.advance_past(map.recovered_op_index().as_u64());

        Ok(Self {
            id,
            map,
            ops,
            frozen: Mutex::new(frozen),
        })
    }

    /// Segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Current tier.
    pub fn tier(&self) -> SegmentTier {
        if self.is_frozen() {
            SegmentTier::ReadOnly
        } else {
            SegmentTier::Mutable
        }
    }

    /// Returns the stored value and its operation index, tombstones included.
    pub fn get(&self, key: &S::Key) -> Option<(S::Value, OpIndex)> {
        self.map.get_entry(key)
    }

    /// Writes `value` under `key` unless the segment is frozen.
    pub fn upsert(&self, key: S::Key, value: S::Value) -> CoreResult<UpsertOutcome> {
        let gate = self.frozen.lock();
        if *gate {
            return Ok(UpsertOutcome::Frozen);
        }
        let op = OpIndex::new(self.ops.next_id());
        if self.map.upsert(key, value, op)? {
            Ok(UpsertOutcome::Added)
        } else {
            Ok(UpsertOutcome::Replaced)
        }
    }

    /// Writes a tombstone for `key` unless the segment is frozen.
    ///
    /// Returns `None` if frozen, otherwise whether this segment held a live
    /// value for the key.
    pub fn delete(&self, key: S::Key) -> CoreResult<Option<bool>> {
        let gate = self.frozen.lock();
        if *gate {
            return Ok(None);
        }
        let op = OpIndex::new(self.ops.next_id());
        self.map.delete(key, op).map(Some)
    }

    /// Stops accepting writes. Waits for an in-flight write to finish.
    pub fn freeze(&self) {
        *self.frozen.lock() = true;
    }

    /// Reopens a frozen segment for writes after an aborted seal.
    pub fn unfreeze(&self) {
        *self.frozen.lock() = false;
    }

    /// Returns true once frozen.
    pub fn is_frozen(&self) -> bool {
        *self.frozen.lock()
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the segment holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Point-in-time copy of every entry in key order.
    pub fn entries(&self) -> Vec<SegmentEntry<S::Key, S::Value>> {
        self.map
            .snapshot()
            .into_iter()
            .map(|(key, value, op_index)| SegmentEntry::new(key, value, op_index))
            .collect()
    }

    /// Rewrites the log to hold only the current entries.
    pub fn compact_log(&self) -> CoreResult<()> {
        self.map.compact_log()
    }

    /// Makes every write to the segment durable.
    pub fn sync_log(&self) -> CoreResult<()> {
        self.map.log().sync()
    }

    /// Removes the segment's log.
    pub fn drop_log(&self) -> CoreResult<()> {
        self.map.drop_log()
    }
}

impl<S: Schema> fmt::Debug for MutableSegment<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableSegment")
            .field("id", &self.id)
            .field("tier", &self.tier())
            .field("len", &self.len())
            .finish()
    }
}
