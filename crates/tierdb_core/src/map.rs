//! Log-backed ordered map.
//!
//! [`RecoverableMap`] pairs an in-memory ordered map with a [`DurableLog`].
//! Every mutation is appended to the log before it is applied in memory,
//! so the log is never behind the map. Opening the map replays the log.

use crate::config::TailPolicy;
use crate::error::{CoreError, CoreResult, LogIssue, LogIssueKind};
use crate::log::{DurableLog, LogRecord};
use crate::schema::{compare_keys, is_deleted, DeletionMarker, Schema, SortKey};
use crate::serializer::Serializer;
use crate::types::OpIndex;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// What happens to deleted values in memory and on replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstonePolicy {
    /// Deleted values are removed from memory and skipped on replay.
    Drop,
    /// Deleted values are kept, so the map can shadow older data.
    Retain,
}

#[derive(Clone)]
struct Slot<V> {
    value: V,
    op_index: OpIndex,
}

/// An ordered map whose every mutation is logged first.
pub struct RecoverableMap<S: Schema> {
    log: DurableLog,
    entries: RwLock<BTreeMap<SortKey<S>, Slot<S::Value>>>,
    policy: TombstonePolicy,
    recovered_op_index: OpIndex,
}

impl<S: Schema> RecoverableMap<S> {
    /// Replays `log` and builds the map.
    ///
    /// # Errors
    ///
    /// If the log holds unreadable records the log is removed and
    /// [`CoreError::LogCorruption`] is returned with every cause. A torn
    /// final record is cut off instead when `tail` is
    /// [`TailPolicy::Truncate`].
    pub fn open(log: DurableLog, policy: TombstonePolicy, tail: TailPolicy) -> CoreResult<Self> {
        let read = log.read_all()?;

        let mut causes = read.causes.clone();
        if tail == TailPolicy::Truncate && read.is_torn_tail_only() {
            warn!(
                segment_id = %log.segment_id(),
                valid_len = read.valid_len,
                "truncating torn log tail"
            );
            log.truncate(read.valid_len)?;
            causes.clear();
        }

        let mut decoded = Vec::with_capacity(read.records.len());
        if causes.is_empty() {
            let mut offset = 0u64;
            for record in &read.records {
                match decode_record::<S>(record) {
                    Ok(entry) => decoded.push(entry),
                    Err(e) => causes.push(LogIssue {
                        offset,
                        kind: LogIssueKind::Undecodable(e.to_string()),
                    }),
                }
                offset += record.encoded_len() as u64;
            }
        }

        if !causes.is_empty() {
            let segment_id = log.segment_id();
            if let Err(e) = log.drop_log() {
                warn!(%segment_id, error = %e, "failed to remove corrupted log");
            }
            return Err(CoreError::LogCorruption { segment_id, causes });
        }

        let recovered_op_index = read.max_op_index();
        let entries = rebuild::<S>(decoded, policy);
        debug!(
            segment_id = %log.segment_id(),
            records = read.records.len(),
            keys = entries.len(),
            "replayed log"
        );

        Ok(Self {
            log,
            entries: RwLock::new(entries),
            policy,
            recovered_op_index,
        })
    }

    /// Highest operation index found when the log was replayed.
    #[must_use]
    pub fn recovered_op_index(&self) -> OpIndex {
        self.recovered_op_index
    }

    /// Returns the value stored for `key`, tombstones included.
    pub fn get(&self, key: &S::Key) -> Option<S::Value> {
        self.get_entry(key).map(|(value, _)| value)
    }

    /// Returns the value and operation index stored for `key`.
    pub fn get_entry(&self, key: &S::Key) -> Option<(S::Value, OpIndex)> {
        self.entries
            .read()
            .get(&SortKey::new(key.clone()))
            .map(|slot| (slot.value.clone(), slot.op_index))
    }

    /// Inserts or replaces `key`.
    ///
    /// Returns true if the key was not present before.
    pub fn upsert(&self, key: S::Key, value: S::Value, op_index: OpIndex) -> CoreResult<bool> {
        let mut entries = self.entries.write();
        self.log.append(&encode_record::<S>(&key, &value, op_index))?;

        let key = SortKey::new(key);
        if self.policy == TombstonePolicy::Drop && is_deleted::<S>(&value) {
            return Ok(entries.remove(&key).is_none());
        }
        Ok(entries.insert(key, Slot { value, op_index }).is_none())
    }

    /// Marks `key` deleted and logs the tombstoned value.
    ///
    /// The tombstone is written even when the key is absent. Returns true if
    /// a live value was deleted.
    pub fn delete(&self, key: S::Key, op_index: OpIndex) -> CoreResult<bool> {
        let mut entries = self.entries.write();
        let sort_key = SortKey::new(key);

        let mut value = entries
            .get(&sort_key)
            .map(|slot| slot.value.clone())
            .unwrap_or_default();
        let was_live = entries.contains_key(&sort_key) && !is_deleted::<S>(&value);
        S::Deletion::mark_deleted(&mut value);

        self.log
            .append(&encode_record::<S>(&sort_key.0, &value, op_index))?;

        match self.policy {
            TombstonePolicy::Drop => {
                entries.remove(&sort_key);
            }
            TombstonePolicy::Retain => {
                entries.insert(sort_key, Slot { value, op_index });
            }
        }
        Ok(was_live)
    }

    /// Rewrites the log to hold exactly the current entries, then rebuilds
    /// the in-memory map from scratch.
    pub fn compact_log(&self) -> CoreResult<()> {
        let mut entries = self.entries.write();
        let records: Vec<LogRecord> = entries
            .iter()
            .map(|(key, slot)| encode_record::<S>(&key.0, &slot.value, slot.op_index))
            .collect();
        self.log.replace(&records)?;

        let fresh: BTreeMap<_, _> = std::mem::take(&mut *entries).into_iter().collect();
        *entries = fresh;
        debug!(segment_id = %self.log.segment_id(), records = records.len(), "compacted log");
        Ok(())
    }

    /// Number of entries in memory, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Point-in-time copy of every entry in key order.
    pub fn snapshot(&self) -> Vec<(S::Key, S::Value, OpIndex)> {
        self.entries
            .read()
            .iter()
            .map(|(key, slot)| (key.0.clone(), slot.value.clone(), slot.op_index))
            .collect()
    }

    /// The backing log.
    pub fn log(&self) -> &DurableLog {
        &self.log
    }

    /// Removes the backing log.
    pub fn drop_log(&self) -> CoreResult<()> {
        self.log.drop_log()
    }
}

impl<S: Schema> fmt::Debug for RecoverableMap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverableMap")
            .field("log", &self.log)
            .field("len", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

fn encode_record<S: Schema>(key: &S::Key, value: &S::Value, op_index: OpIndex) -> LogRecord {
    LogRecord::new(
        op_index,
        S::KeySerializer::to_bytes(key),
        S::ValueSerializer::to_bytes(value),
    )
}

fn decode_record<S: Schema>(record: &LogRecord) -> CoreResult<(S::Key, S::Value, OpIndex)> {
    Ok((
        S::KeySerializer::deserialize(&record.key)?,
        S::ValueSerializer::deserialize(&record.value)?,
        record.op_index,
    ))
}

/// Stable-sorts replayed records by key and keeps the last write per key.
fn rebuild<S: Schema>(
    mut records: Vec<(S::Key, S::Value, OpIndex)>,
    policy: TombstonePolicy,
) -> BTreeMap<SortKey<S>, Slot<S::Value>> {
    records.sort_by(|a, b| compare_keys::<S>(&a.0, &b.0));

    let mut entries = BTreeMap::new();
    let mut iter = records.into_iter().peekable();
    while let Some((key, value, op_index)) = iter.next() {
        let superseded = iter
            .peek()
            .is_some_and(|next| compare_keys::<S>(&key, &next.0).is_eq());
        if superseded {
            continue;
        }
        if policy == TombstonePolicy::Drop && is_deleted::<S>(&value) {
            continue;
        }
        entries.insert(SortKey::new(key), Slot { value, op_index });
    }
    entries
}
