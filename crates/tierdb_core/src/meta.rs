//! Segment topology metadata.
//!
//! [`TreeMeta`] records which segments make up the engine. Snapshots are
//! JSON documents appended to a [`MetaLog`]; the last readable snapshot is
//! the current one.

use crate::category;
use crate::config::{EngineOptions, LogOptions};
use crate::error::{CoreError, CoreResult};
use crate::log::{DurableLog, LogRecord};
use crate::schema::{Schema, SchemaTypes};
use crate::types::{OpIndex, SegmentId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tierdb_storage::StoreProvider;
use tracing::{debug, warn};

/// Store id of the metadata log.
const META_STORE_ID: SegmentId = SegmentId::EMPTY;

/// Snapshots appended before the log is rewritten to the latest one.
const REWRITE_AFTER: usize = 64;

const SNAPSHOT_KEY: &[u8] = b"meta";

/// Persisted segment topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMeta {
    /// Type names of the schema the engine was created with.
    #[serde(flatten)]
    pub schema: SchemaTypes,
    /// The mutable segment.
    pub mutable_segment: SegmentId,
    /// The disk segment; [`SegmentId::EMPTY`] if none.
    pub disk_segment: SegmentId,
    /// Read-only segments, newest first.
    pub read_only_segments: Vec<SegmentId>,
    /// Bottom segments, newest first.
    pub bottom_segments: Vec<SegmentId>,
    /// Highest operation index handed out.
    pub maximum_op_index: OpIndex,
    /// Highest segment or part id handed out.
    pub maximum_segment_id: u64,
    /// Options the engine runs with.
    pub options: EngineOptions,
}

impl TreeMeta {
    /// Checks the stored type names against `S`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] naming the first mismatch.
    pub fn check_schema<S: Schema>(&self) -> CoreResult<()> {
        let expected = SchemaTypes::of::<S>();
        let pairs = [
            ("comparer", &self.schema.comparer_type, &expected.comparer_type),
            ("key", &self.schema.key_type, &expected.key_type),
            ("value", &self.schema.value_type, &expected.value_type),
            (
                "key serializer",
                &self.schema.key_serializer_type,
                &expected.key_serializer_type,
            ),
            (
                "value serializer",
                &self.schema.value_serializer_type,
                &expected.value_serializer_type,
            ),
        ];
        for (what, stored, wanted) in pairs {
            if stored != wanted {
                return Err(CoreError::invalid_format(format!(
                    "{what} type mismatch: stored {stored}, opened with {wanted}"
                )));
            }
        }
        Ok(())
    }

    /// Every segment id referenced by the snapshot.
    #[must_use]
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        let mut ids = vec![self.mutable_segment, self.disk_segment];
        ids.extend(&self.read_only_segments);
        ids.extend(&self.bottom_segments);
        ids.retain(|id| *id != SegmentId::EMPTY);
        ids
    }
}

/// Append-only log of [`TreeMeta`] snapshots.
#[derive(Debug)]
pub struct MetaLog {
    log: DurableLog,
    // Sequence of the last snapshot, and snapshots since the last rewrite.
    state: Mutex<(u64, usize)>,
}

impl MetaLog {
    /// Opens the metadata log, creating it if missing.
    pub fn open(provider: Arc<dyn StoreProvider>) -> CoreResult<Self> {
        let log = DurableLog::open(
            provider,
            META_STORE_ID,
            category::META,
            LogOptions::default().sync_on_write(true),
        )?;
        Ok(Self {
            log,
            state: Mutex::new((0, 0)),
        })
    }

    /// Returns true if a metadata store exists for `provider`.
    pub fn exists(provider: &dyn StoreProvider) -> bool {
        provider.exists(META_STORE_ID.as_u64(), category::META)
    }

    /// Reads the newest readable snapshot.
    ///
    /// Unreadable records are skipped with a warning; an older snapshot is
    /// used if the newest one is damaged.
    pub fn load(&self) -> CoreResult<Option<TreeMeta>> {
        let read = self.log.read_all()?;
        if !read.is_clean() {
            warn!(causes = read.causes.len(), "metadata log has unreadable records");
        }

        let mut state = self.state.lock();
        state.1 = read.records.len();
        for record in read.records.iter().rev() {
            match serde_json::from_slice::<TreeMeta>(&record.value) {
                Ok(meta) => {
                    state.0 = record.op_index.as_u64();
                    return Ok(Some(meta));
                }
                Err(e) => warn!(sequence = %record.op_index, error = %e, "skipping metadata snapshot"),
            }
        }
        Ok(None)
    }

    /// Appends a snapshot, rewriting the log when it has grown.
    pub fn save(&self, meta: &TreeMeta) -> CoreResult<()> {
        let json = serde_json::to_vec(meta)?;

        let mut state = self.state.lock();
        state.0 += 1;
        let record = LogRecord::new(OpIndex::new(state.0), SNAPSHOT_KEY.to_vec(), json);

        if state.1 + 1 >= REWRITE_AFTER {
            self.log.replace(std::slice::from_ref(&record))?;
            state.1 = 1;
            debug!(sequence = state.0, "rewrote metadata log");
        } else {
            self.log.append(&record)?;
            state.1 += 1;
        }
        Ok(())
    }

    /// Removes the metadata log.
    pub fn drop_log(&self) -> CoreResult<()> {
        self.log.drop_log()
    }
}
