//! The tiered engine.
//!
//! An [`Engine`] owns four tiers:
//!
//! - one mutable segment receiving writes,
//! - a queue of read-only segments waiting to be merged,
//! - one disk segment produced by merges,
//! - a queue of bottom segments holding disk segments that outgrew
//!   `disk_segment_max_item_count`.
//!
//! Reads consult the tiers newest first and stop at the first hit. A hit
//! on a tombstone reads as absent.
//!
//! Topology changes (sealing the mutable segment, publishing a merge) run
//! under the short lock and then the update lock, in that order, and save a
//! [`TreeMeta`] snapshot before the new topology becomes visible to writers.

mod merge;

pub use merge::MergeOutcome;

use crate::category;
use crate::config::EngineOptions;
use crate::disk::DiskSegment;
use crate::error::{CoreError, CoreResult};
use crate::events::{EngineEvent, EventBus, EventKind, SubscriptionId};
use crate::merge::{MergeIterator, SegmentCursor, SegmentEntry};
use crate::meta::{MetaLog, TreeMeta};
use crate::schema::{is_deleted, Schema, SchemaTypes};
use crate::segment::{MutableSegment, SegmentQueue, UpsertOutcome};
use crate::types::{IdProvider, OpIndex, SegmentId};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tierdb_storage::StoreProvider;
use tracing::{debug, info, warn};

/// An ordered key-value engine over a [`StoreProvider`].
///
/// Shared across threads behind an [`Arc`]. Reads never block on merges;
/// writes only wait for the brief window in which the mutable segment is
/// swapped.
pub struct Engine<S: Schema> {
    options: EngineOptions,
    provider: Arc<dyn StoreProvider>,
    events: Arc<EventBus>,
    meta: MetaLog,
    // Segment and part ids share one sequence.
    segment_ids: Arc<IdProvider>,
    ops: Arc<IdProvider>,
    mutable: ArcSwap<MutableSegment<S>>,
    read_only: SegmentQueue<Arc<MutableSegment<S>>>,
    disk: ArcSwap<DiskSegment<S>>,
    bottom: SegmentQueue<Arc<DiskSegment<S>>>,
    short_lock: Mutex<()>,
    update_lock: Mutex<()>,
    merge_lock: Mutex<()>,
    bottom_merge_lock: Mutex<()>,
    merging: AtomicBool,
    bottom_merging: AtomicBool,
    cancel_merge: AtomicBool,
    cancel_bottom_merge: AtomicBool,
    read_only_mode: AtomicBool,
    closed: AtomicBool,
    // Superseded disk segments whose stores could not be removed yet.
    pending_drops: Mutex<Vec<Arc<DiskSegment<S>>>>,
}

impl<S: Schema> Engine<S> {
    /// Opens the engine stored in `provider`, creating it if empty.
    ///
    /// Recovery replays the logs of the mutable and read-only segments and
    /// reopens the disk and bottom segments named by the newest metadata
    /// snapshot. Stores no snapshot refers to are left over from an
    /// interrupted merge or seal and are removed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidFormat`] if the stored schema differs from `S`.
    /// - [`CoreError::LogCorruption`] if a segment log is damaged.
    /// - Storage errors from the provider.
    pub fn open(options: EngineOptions, provider: Arc<dyn StoreProvider>) -> CoreResult<Arc<Self>> {
        options.disk_segment.validate()?;
        if options.mutable_segment_max_item_count == 0 {
            return Err(CoreError::invalid_operation(
                "mutable_segment_max_item_count must be positive",
            ));
        }

        let events = Arc::new(EventBus::new());
        let existed = MetaLog::exists(provider.as_ref());
        let meta_log = MetaLog::open(Arc::clone(&provider))?;
        let stored = if existed { meta_log.load()? } else { None };

        let segment_ids = Arc::new(IdProvider::new());
        let mut has_stores = false;
        for cat in [category::SEGMENT_LOG, category::DISK_HEADER, category::DISK_PART] {
            for id in provider.list(cat)? {
                segment_ids.advance_past(id);
                has_stores = true;
            }
        }
        if stored.is_none() && has_stores {
            return Err(CoreError::invalid_format(
                "segment stores exist but no readable metadata snapshot was found",
            ));
        }

        let engine = match stored {
            Some(meta) => Self::recover(options, provider, events, meta_log, segment_ids, meta)?,
            None => Self::create(options, provider, events, meta_log, segment_ids)?,
        };
        engine.remove_orphans();
        Ok(Arc::new(engine))
    }

    fn create(
        options: EngineOptions,
        provider: Arc<dyn StoreProvider>,
        events: Arc<EventBus>,
        meta: MetaLog,
        segment_ids: Arc<IdProvider>,
    ) -> CoreResult<Self> {
        let ops = Arc::new(IdProvider::new());
        let mutable_id = SegmentId::new(segment_ids.next_id());
        let mutable = MutableSegment::open(
            Arc::clone(&provider),
            mutable_id,
            Arc::clone(&ops),
            options.log,
            false,
        )?;
        let disk = DiskSegment::empty(Arc::clone(&provider), options.disk_segment, Arc::clone(&events));

        let engine = Self::assemble(
            options,
            provider,
            events,
            meta,
            segment_ids,
            ops,
            mutable,
            Vec::new(),
            disk,
            Vec::new(),
        );
        engine.meta.save(&engine.current_meta(mutable_id))?;
        info!(mutable_segment = %mutable_id, "created engine");
        Ok(engine)
    }

    fn recover(
        options: EngineOptions,
        provider: Arc<dyn StoreProvider>,
        events: Arc<EventBus>,
        meta_log: MetaLog,
        segment_ids: Arc<IdProvider>,
        meta: TreeMeta,
    ) -> CoreResult<Self> {
        meta.check_schema::<S>()?;
        segment_ids.advance_past(meta.maximum_segment_id);
        for id in meta.segment_ids() {
            segment_ids.advance_past(id.as_u64());
        }
        let ops = Arc::new(IdProvider::starting_after(meta.maximum_op_index.as_u64()));

        let open_log = |id: SegmentId, frozen: bool| {
            MutableSegment::open(Arc::clone(&provider), id, Arc::clone(&ops), options.log, frozen)
        };
        let mutable = open_log(meta.mutable_segment, false)?;
        let read_only = meta
            .read_only_segments
            .iter()
            .map(|id| open_log(*id, true).map(Arc::new))
            .collect::<CoreResult<Vec<_>>>()?;

        let open_disk = |id: SegmentId| {
            DiskSegment::open(Arc::clone(&provider), id, options.disk_segment, Arc::clone(&events))
        };
        let disk = open_disk(meta.disk_segment)?;
        let bottom = meta
            .bottom_segments
            .iter()
            .map(|id| open_disk(*id).map(Arc::new))
            .collect::<CoreResult<Vec<_>>>()?;

        info!(
            mutable_segment = %meta.mutable_segment,
            read_only_segments = read_only.len(),
            disk_segment = %meta.disk_segment,
            bottom_segments = bottom.len(),
            "recovered engine"
        );

        Ok(Self::assemble(
            options,
            provider,
            events,
            meta_log,
            segment_ids,
            ops,
            mutable,
            read_only,
            disk,
            bottom,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        options: EngineOptions,
        provider: Arc<dyn StoreProvider>,
        events: Arc<EventBus>,
        meta: MetaLog,
        segment_ids: Arc<IdProvider>,
        ops: Arc<IdProvider>,
        mutable: MutableSegment<S>,
        read_only: Vec<Arc<MutableSegment<S>>>,
        disk: DiskSegment<S>,
        bottom: Vec<Arc<DiskSegment<S>>>,
    ) -> Self {
        Self {
            options,
            provider,
            events,
            meta,
            segment_ids,
            ops,
            mutable: ArcSwap::from_pointee(mutable),
            read_only: SegmentQueue::from_newest_first(read_only),
            disk: ArcSwap::from_pointee(disk),
            bottom: SegmentQueue::from_newest_first(bottom),
            short_lock: Mutex::new(()),
            update_lock: Mutex::new(()),
            merge_lock: Mutex::new(()),
            bottom_merge_lock: Mutex::new(()),
            merging: AtomicBool::new(false),
            bottom_merging: AtomicBool::new(false),
            cancel_merge: AtomicBool::new(false),
            cancel_bottom_merge: AtomicBool::new(false),
            read_only_mode: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pending_drops: Mutex::new(Vec::new()),
        }
    }

    /// Removes stores that no live segment refers to.
    fn remove_orphans(&self) {
        let mut logs: HashSet<u64> = HashSet::new();
        logs.insert(self.mutable.load().id().as_u64());
        logs.extend(self.read_only.snapshot().iter().map(|s| s.id().as_u64()));

        let mut disks = vec![self.disk.load_full()];
        disks.extend(self.bottom.snapshot());
        let headers: HashSet<u64> = disks.iter().map(|d| d.id().as_u64()).collect();
        let parts: HashSet<u64> = disks.iter().flat_map(|d| d.part_ids()).collect();

        for (cat, live) in [
            (category::SEGMENT_LOG, &logs),
            (category::DISK_HEADER, &headers),
            (category::DISK_PART, &parts),
        ] {
            let listed = match self.provider.list(cat) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(category = cat, error = %e, "failed to list stores");
                    continue;
                }
            };
            for id in listed.into_iter().filter(|id| !live.contains(id)) {
                match self.provider.remove(id, cat) {
                    Ok(()) => debug!(category = cat, id, "removed orphaned store"),
                    Err(e) => warn!(category = cat, id, error = %e, "failed to remove orphaned store"),
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Returns the live value of `key`.
    pub fn get(&self, key: &S::Key) -> CoreResult<Option<S::Value>> {
        Ok(self
            .find(key)?
            .filter(|value| !is_deleted::<S>(value)))
    }

    /// Returns true if `key` has a live value.
    pub fn contains_key(&self, key: &S::Key) -> CoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Newest stored value of `key` in any tier, tombstones included.
    fn find(&self, key: &S::Key) -> CoreResult<Option<S::Value>> {
        if let Some((value, _)) = self.mutable.load().get(key) {
            return Ok(Some(value));
        }
        for segment in self.read_only.snapshot() {
            if let Some((value, _)) = segment.get(key) {
                return Ok(Some(value));
            }
        }
        if let Some((value, _)) = self.disk.load_full().get(key)? {
            return Ok(Some(value));
        }
        for segment in self.bottom.snapshot() {
            if let Some((value, _)) = segment.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Ordered iterator over every live entry.
    ///
    /// The iterator reads a point-in-time set of segments. Writes made after
    /// it was created may or may not be visible; merges never hide entries
    /// from it.
    pub fn iter(&self) -> CoreResult<EngineIter<S>> {
        Ok(EngineIter {
            inner: MergeIterator::new(self.all_sources())?,
        })
    }

    /// Cursors over every tier, newest first, taken under the topology locks.
    fn all_sources(&self) -> Vec<SegmentCursor<'static, S::Key, S::Value>> {
        let (in_memory, disk_cursors) = {
            let _short = self.short_lock.lock();
            let _update = self.update_lock.lock();
            let mut disk_cursors: Vec<SegmentCursor<'static, S::Key, S::Value>> =
                vec![Box::new(self.disk.load_full().iter())];
            for segment in self.bottom.snapshot() {
                disk_cursors.push(Box::new(segment.iter()));
            }
            (self.in_memory_segments(), disk_cursors)
        };

        let mut sources = memory_cursors(&in_memory);
        sources.extend(disk_cursors);
        sources
    }

    /// The mutable segment followed by the read-only segments, newest first.
    fn in_memory_segments(&self) -> Vec<Arc<MutableSegment<S>>> {
        let mut segments = vec![self.mutable.load_full()];
        segments.extend(self.read_only.snapshot());
        segments
    }

    /// Number of live keys.
    ///
    /// Without bottom segments the count starts from the disk segment and
    /// is corrected by the in-memory tiers. With bottom segments it falls
    /// back to [`Engine::count_full_scan`].
    pub fn count(&self) -> CoreResult<usize> {
        let snapshot = {
            let _short = self.short_lock.lock();
            let _update = self.update_lock.lock();
            if self.bottom.is_empty() {
                let disk = self.disk.load_full();
                // Keep the disk segment's stores while counting.
                disk.attach_iterator();
                Some((self.in_memory_segments(), disk))
            } else {
                None
            }
        };

        let Some((in_memory, disk)) = snapshot else {
            return self.count_full_scan();
        };
        let result = count_with_disk::<S>(&in_memory, &disk);
        disk.detach_iterator();
        result
    }

    /// Number of live keys, counted by iterating every tier.
    pub fn count_full_scan(&self) -> CoreResult<usize> {
        let mut count = 0;
        for entry in self.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Writes `value` under `key`.
    ///
    /// Returns true if the key was not present in the mutable segment.
    /// Seals the mutable segment once it reaches
    /// `mutable_segment_max_item_count`.
    pub fn upsert(&self, key: S::Key, value: S::Value) -> CoreResult<bool> {
        self.check_writable()?;
        loop {
            let segment = self.mutable.load_full();
            match segment.upsert(key.clone(), value.clone())? {
                UpsertOutcome::Frozen => thread::yield_now(),
                outcome => {
                    self.seal_if_full(&segment);
                    return Ok(outcome == UpsertOutcome::Added);
                }
            }
        }
    }

    /// Deletes `key`.
    ///
    /// A tombstone is written even when the key is absent. Returns true if
    /// the key had a live value.
    pub fn delete(&self, key: S::Key) -> CoreResult<bool> {
        self.check_writable()?;
        let existed = self.contains_key(&key)?;
        self.write_tombstone(key)?;
        Ok(existed)
    }

    /// Writes a tombstone for `key` without looking it up first.
    pub fn force_delete(&self, key: S::Key) -> CoreResult<()> {
        self.check_writable()?;
        self.write_tombstone(key)
    }

    fn write_tombstone(&self, key: S::Key) -> CoreResult<()> {
        loop {
            let segment = self.mutable.load_full();
            match segment.delete(key.clone())? {
                None => thread::yield_now(),
                Some(_) => {
                    self.seal_if_full(&segment);
                    return Ok(());
                }
            }
        }
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::invalid_operation("engine is closed"));
        }
        if self.read_only_mode.load(Ordering::SeqCst) {
            return Err(CoreError::ReadOnly);
        }
        Ok(())
    }

    /// Seals `segment` once it is full. The write that filled it has already
    /// landed, so a failed seal is logged and retried on the next write.
    fn seal_if_full(&self, segment: &MutableSegment<S>) {
        if segment.len() < self.options.mutable_segment_max_item_count {
            return;
        }
        if let Err(e) = self.seal(Some(segment.id())) {
            warn!(segment_id = %segment.id(), error = %e, "automatic seal failed");
        }
    }

    /// Switches the engine in and out of read-only mode.
    ///
    /// In read-only mode writes fail with [`CoreError::ReadOnly`]; merges
    /// still run.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only_mode.store(read_only, Ordering::SeqCst);
    }

    /// Returns true in read-only mode.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only_mode.load(Ordering::SeqCst)
    }

    /// Seals the mutable segment into the read-only queue and starts a new
    /// one. Returns the id of the sealed segment.
    pub fn seal_mutable_segment(&self) -> CoreResult<SegmentId> {
        match self.seal(None)? {
            Some(id) => Ok(id),
            None => Err(CoreError::invalid_operation("mutable segment was not sealed")),
        }
    }

    /// Seals the mutable segment if it is still `expected` (or always, when
    /// `expected` is `None`).
    ///
    /// The new topology is saved before the new segment is swapped in. If the
    /// save fails the seal is rolled back and the current segment keeps
    /// taking writes.
    fn seal(&self, expected: Option<SegmentId>) -> CoreResult<Option<SegmentId>> {
        let (sealed, read_only_count) = {
            let _short = self.short_lock.lock();
            let _update = self.update_lock.lock();

            let current = self.mutable.load_full();
            if expected.is_some_and(|id| id != current.id()) {
                return Ok(None);
            }

            let next_id = SegmentId::new(self.segment_ids.next_id());
            let next = MutableSegment::open(
                Arc::clone(&self.provider),
                next_id,
                Arc::clone(&self.ops),
                self.options.log,
                false,
            )?;

            // Writers retry against the new segment once it is swapped in.
            current.freeze();
            self.read_only.enqueue(Arc::clone(&current));
            let saved = current
                .sync_log()
                .and_then(|()| self.meta.save(&self.current_meta(next_id)));
            if let Err(e) = saved {
                self.read_only.remove_where(|s| s.id() == current.id());
                current.unfreeze();
                if let Err(drop_err) = next.drop_log() {
                    warn!(segment_id = %next_id, error = %drop_err, "failed to drop unused segment log");
                }
                warn!(segment_id = %current.id(), error = %e, "seal rolled back; metadata not saved");
                return Err(e);
            }
            self.mutable.store(Arc::new(next));
            (current.id(), self.read_only.len())
        };

        debug!(segment_id = %sealed, read_only_count, "sealed mutable segment");
        self.events.emit(&EngineEvent::MutableSegmentSealed {
            segment_id: sealed,
            read_only_count,
        });
        Ok(Some(sealed))
    }

    // ---------------------------------------------------------------------
    // Metadata
    // ---------------------------------------------------------------------

    /// Persists the current topology.
    pub fn save_metadata(&self) -> CoreResult<()> {
        let _short = self.short_lock.lock();
        let _update = self.update_lock.lock();
        self.meta
            .save(&self.current_meta(self.mutable.load().id()))
    }

    /// Snapshot of the topology with `mutable_id` as the mutable segment.
    /// Callers hold the topology locks.
    fn current_meta(&self, mutable_id: SegmentId) -> TreeMeta {
        TreeMeta {
            schema: SchemaTypes::of::<S>(),
            mutable_segment: mutable_id,
            disk_segment: self.disk.load().id(),
            read_only_segments: self.read_only.snapshot().iter().map(|s| s.id()).collect(),
            bottom_segments: self.bottom.snapshot().iter().map(|s| s.id()).collect(),
            maximum_op_index: OpIndex::new(self.ops.last_id()),
            maximum_segment_id: self.segment_ids.last_id(),
            options: self.options,
        }
    }

    // ---------------------------------------------------------------------
    // Statistics
    // ---------------------------------------------------------------------

    /// Options the engine was opened with.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Id of the mutable segment.
    #[must_use]
    pub fn mutable_segment_id(&self) -> SegmentId {
        self.mutable.load().id()
    }

    /// Ids of the read-only segments, newest first.
    #[must_use]
    pub fn read_only_segment_ids(&self) -> Vec<SegmentId> {
        self.read_only.snapshot().iter().map(|s| s.id()).collect()
    }

    /// The current disk segment.
    #[must_use]
    pub fn disk_segment(&self) -> Arc<DiskSegment<S>> {
        self.disk.load_full()
    }

    /// The bottom segments, newest first.
    #[must_use]
    pub fn bottom_segments(&self) -> Vec<Arc<DiskSegment<S>>> {
        self.bottom.snapshot()
    }

    /// Number of read-only segments.
    #[must_use]
    pub fn read_only_segments_count(&self) -> usize {
        self.read_only.len()
    }

    /// Entries held by read-only segments, tombstones included.
    #[must_use]
    pub fn read_only_segments_record_count(&self) -> usize {
        self.read_only.snapshot().iter().map(|s| s.len()).sum()
    }

    /// Entries held by the mutable segment, tombstones included.
    #[must_use]
    pub fn mutable_segment_record_count(&self) -> usize {
        self.mutable.load().len()
    }

    /// Entries held in memory, tombstones included.
    #[must_use]
    pub fn in_memory_record_count(&self) -> usize {
        self.in_memory_segments().iter().map(|s| s.len()).sum()
    }

    /// Records in the disk segment.
    #[must_use]
    pub fn disk_segment_record_count(&self) -> usize {
        self.disk.load().len()
    }

    /// Number of bottom segments.
    #[must_use]
    pub fn bottom_segments_count(&self) -> usize {
        self.bottom.len()
    }

    /// Records in the bottom segments.
    #[must_use]
    pub fn bottom_segments_record_count(&self) -> usize {
        self.bottom.snapshot().iter().map(|s| s.len()).sum()
    }

    /// Records in every tier, duplicates and tombstones included.
    #[must_use]
    pub fn total_record_count(&self) -> usize {
        let _short = self.short_lock.lock();
        self.in_memory_record_count()
            + self.disk_segment_record_count()
            + self.bottom_segments_record_count()
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Rewrites the mutable segment's log to its current entries.
    pub fn compact_mutable_segment_log(&self) -> CoreResult<()> {
        self.mutable.load().compact_log()
    }

    /// Drops decoded blocks not accessed since `older_than`.
    pub fn release_read_buffers(&self, older_than: Instant) -> usize {
        self.disk_segments()
            .iter()
            .map(|s| s.release_read_buffers(older_than))
            .sum()
    }

    /// Drops key cache records idle past their lifetime at `now`.
    pub fn release_circular_key_cache_records(&self, now: Instant) -> usize {
        self.disk_segments()
            .iter()
            .map(|s| s.release_circular_key_cache_records(now))
            .sum()
    }

    /// Drops value cache records idle past their lifetime at `now`.
    pub fn release_circular_value_cache_records(&self, now: Instant) -> usize {
        self.disk_segments()
            .iter()
            .map(|s| s.release_circular_value_cache_records(now))
            .sum()
    }

    fn disk_segments(&self) -> Vec<Arc<DiskSegment<S>>> {
        let mut segments = vec![self.disk.load_full()];
        segments.extend(self.bottom.snapshot());
        segments
    }

    /// Retries removing superseded disk segments whose stores remain.
    ///
    /// Returns the number still pending.
    pub fn retry_pending_drops(&self) -> usize {
        let mut pending = self.pending_drops.lock();
        pending.retain(|segment| !segment.drop_segment());
        pending.len()
    }

    /// Supersedes a disk segment; it is removed once no iterator holds it.
    fn retire(&self, segment: Arc<DiskSegment<S>>) {
        if segment.id() == SegmentId::EMPTY {
            return;
        }
        if !segment.drop_segment() {
            self.pending_drops.lock().push(segment);
        }
    }

    /// Drops the logs of merged read-only segments.
    fn drop_read_only_logs(&self, segments: &[Arc<MutableSegment<S>>]) {
        for segment in segments {
            if let Err(e) = segment.drop_log() {
                warn!(segment_id = %segment.id(), error = %e, "failed to drop read-only segment log");
                self.events.emit(&EngineEvent::ReadOnlySegmentDropFailed {
                    segment_id: segment.id(),
                    error: e.to_string(),
                });
            }
        }
    }

    // ---------------------------------------------------------------------
    // Events and lifecycle
    // ---------------------------------------------------------------------

    /// The event bus.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Registers an event listener.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, listener)
    }

    /// Returns true once [`Engine::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cancels running merges, waits for them, and saves the topology.
    ///
    /// Fires [`EngineEvent::Disposing`]. Later writes fail; reads keep
    /// working. Closing twice is a no-op.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.events.emit(&EngineEvent::Disposing);

        self.request_merge_cancellation();
        self.request_bottom_segments_merge_cancellation();
        drop(self.merge_lock.lock());
        drop(self.bottom_merge_lock.lock());

        self.mutable.load().sync_log()?;
        self.save_metadata()?;
        self.retry_pending_drops();
        info!("closed engine");
        Ok(())
    }

    /// Closes the engine and removes every store it owns.
    pub fn destroy(&self) -> CoreResult<()> {
        self.close()?;
        self.provider.remove_all()?;
        info!("destroyed engine");
        Ok(())
    }
}

impl<S: Schema> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("mutable_segment", &self.mutable_segment_id())
            .field("read_only_segments", &self.read_only.len())
            .field("disk_segment", &self.disk.load().id())
            .field("bottom_segments", &self.bottom.len())
            .field("read_only", &self.is_read_only())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Cursors over in-memory segments, in the order given.
fn memory_cursors<S: Schema>(
    segments: &[Arc<MutableSegment<S>>],
) -> Vec<SegmentCursor<'static, S::Key, S::Value>> {
    segments
        .iter()
        .map(|segment| {
            Box::new(segment.entries().into_iter().map(Ok)) as SegmentCursor<'static, _, _>
        })
        .collect()
}

/// Live count of the disk segment corrected by newer in-memory entries.
///
/// Assumes the disk segment holds no tombstones, which holds while there
/// are no bottom segments.
fn count_with_disk<S: Schema>(
    in_memory: &[Arc<MutableSegment<S>>],
    disk: &DiskSegment<S>,
) -> CoreResult<usize> {
    let mut count = disk.len();
    for entry in MergeIterator::<S>::new(memory_cursors(in_memory))? {
        let entry = entry?;
        let on_disk = disk.get(&entry.key)?.is_some();
        match (is_deleted::<S>(&entry.value), on_disk) {
            (true, true) => count -= 1,
            (false, false) => count += 1,
            _ => {}
        }
    }
    Ok(count)
}

/// Ordered iterator over the live entries of an [`Engine`].
///
/// Yields `(key, value)` pairs in ascending key order. Disk segments read
/// by the iterator stay on disk until it is dropped.
pub struct EngineIter<S: Schema> {
    inner: MergeIterator<'static, S>,
}

impl<S: Schema> Iterator for EngineIter<S> {
    type Item = CoreResult<(S::Key, S::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(SegmentEntry { key, value, .. }) => {
                    if !is_deleted::<S>(&value) {
                        return Some(Ok((key, value)));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl<S: Schema> fmt::Debug for EngineIter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineIter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BytesSchema, Deletable};
    use tierdb_storage::InMemoryStoreProvider;

    type Value = Deletable<Vec<u8>>;

    fn live(s: &str) -> Value {
        Deletable::new(s.as_bytes().to_vec())
    }

    fn k(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn open(provider: &Arc<InMemoryStoreProvider>) -> Arc<Engine<BytesSchema>> {
        Engine::open(
            EngineOptions::new().mutable_segment_max_item_count(100),
            Arc::clone(provider) as Arc<dyn StoreProvider>,
        )
        .unwrap()
    }

    #[test]
    fn reads_see_newest_tier() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);

        engine.upsert(k("a"), live("disk")).unwrap();
        engine.seal_mutable_segment().unwrap();
        engine.merge_read_only_segments().unwrap();
        engine.upsert(k("a"), live("read-only")).unwrap();
        engine.seal_mutable_segment().unwrap();
        assert_eq!(engine.get(&k("a")).unwrap(), Some(live("read-only")));

        engine.upsert(k("a"), live("mutable")).unwrap();
        assert_eq!(engine.get(&k("a")).unwrap(), Some(live("mutable")));
        assert_eq!(engine.get(&k("missing")).unwrap(), None);
    }

    #[test]
    fn delete_reports_prior_liveness() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);

        engine.upsert(k("a"), live("1")).unwrap();
        engine.seal_mutable_segment().unwrap();

        assert!(engine.delete(k("a")).unwrap());
        assert!(!engine.delete(k("a")).unwrap());
        assert!(!engine.delete(k("never")).unwrap());
        assert!(!engine.contains_key(&k("a")).unwrap());

        // Tombstones are written for absent keys too.
        assert_eq!(engine.mutable_segment_record_count(), 2);
    }

    #[test]
    fn upsert_reports_added_in_mutable_segment() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        assert!(engine.upsert(k("a"), live("1")).unwrap());
        assert!(!engine.upsert(k("a"), live("2")).unwrap());
    }

    #[test]
    fn mutable_segment_seals_at_threshold() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        for i in 0..250u32 {
            engine.upsert(i.to_be_bytes().to_vec(), live("v")).unwrap();
        }
        assert_eq!(engine.read_only_segments_count(), 2);
        assert_eq!(engine.mutable_segment_record_count(), 50);
        assert_eq!(engine.in_memory_record_count(), 250);
        assert_eq!(engine.count().unwrap(), 250);
    }

    #[test]
    fn count_matches_full_scan() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        for i in 0..20u8 {
            engine.upsert(vec![i], live("v")).unwrap();
        }
        engine.seal_mutable_segment().unwrap();
        engine.merge_read_only_segments().unwrap();
        for i in 10..30u8 {
            engine.upsert(vec![i], live("w")).unwrap();
        }
        for i in 0..5u8 {
            engine.delete(vec![i]).unwrap();
        }
        engine.force_delete(vec![200]).unwrap();

        assert_eq!(engine.count_full_scan().unwrap(), 25);
        assert_eq!(engine.count().unwrap(), 25);
    }

    #[test]
    fn iteration_is_ordered_and_skips_tombstones() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        engine.upsert(k("c"), live("3")).unwrap();
        engine.upsert(k("a"), live("1")).unwrap();
        engine.seal_mutable_segment().unwrap();
        engine.merge_read_only_segments().unwrap();
        engine.upsert(k("b"), live("2")).unwrap();
        engine.delete(k("c")).unwrap();

        let entries: Vec<_> = engine.iter().unwrap().map(Result::unwrap).collect();
        assert_eq!(
            entries,
            vec![(k("a"), live("1")), (k("b"), live("2"))]
        );
    }

    #[test]
    fn reopen_restores_every_tier() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        {
            let engine = open(&provider);
            engine.upsert(k("disk"), live("1")).unwrap();
            engine.seal_mutable_segment().unwrap();
            engine.merge_read_only_segments().unwrap();
            engine.upsert(k("ro"), live("2")).unwrap();
            engine.seal_mutable_segment().unwrap();
            engine.upsert(k("mut"), live("3")).unwrap();
            engine.delete(k("disk")).unwrap();
            engine.close().unwrap();
        }

        let engine = open(&provider);
        assert_eq!(engine.read_only_segments_count(), 1);
        assert_eq!(engine.get(&k("disk")).unwrap(), None);
        assert_eq!(engine.get(&k("ro")).unwrap(), Some(live("2")));
        assert_eq!(engine.get(&k("mut")).unwrap(), Some(live("3")));

        // New writes still order after recovered ones.
        engine.upsert(k("ro"), live("4")).unwrap();
        engine.seal_mutable_segment().unwrap();
        engine.merge_read_only_segments().unwrap();
        assert_eq!(engine.get(&k("ro")).unwrap(), Some(live("4")));
    }

    #[test]
    fn read_only_mode_rejects_writes() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        engine.set_read_only(true);
        assert!(matches!(
            engine.upsert(k("a"), live("1")),
            Err(CoreError::ReadOnly)
        ));
        assert!(matches!(engine.delete(k("a")), Err(CoreError::ReadOnly)));
        engine.set_read_only(false);
        assert!(engine.upsert(k("a"), live("1")).is_ok());
    }

    #[test]
    fn closed_engine_rejects_writes_but_reads() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        engine.upsert(k("a"), live("1")).unwrap();

        let disposing = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disposing);
        engine.subscribe(EventKind::Disposing, move |_| flag.store(true, Ordering::SeqCst));

        engine.close().unwrap();
        engine.close().unwrap();
        assert!(disposing.load(Ordering::SeqCst));
        assert!(engine.upsert(k("b"), live("2")).is_err());
        assert_eq!(engine.get(&k("a")).unwrap(), Some(live("1")));
    }

    #[test]
    fn orphaned_stores_are_removed_on_open() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        drop(open(&provider));
        provider.create(999, category::SEGMENT_LOG).unwrap();
        provider.create(998, category::DISK_PART).unwrap();

        let engine = open(&provider);
        assert!(!provider.exists(999, category::SEGMENT_LOG));
        assert!(!provider.exists(998, category::DISK_PART));
        assert!(engine.mutable_segment_id().as_u64() < 998);

        engine.seal_mutable_segment().unwrap();
        assert!(engine.mutable_segment_id().as_u64() > 999);
    }

    #[test]
    fn destroy_removes_stores() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        engine.upsert(k("a"), live("1")).unwrap();
        engine.destroy().unwrap();
        assert!(provider.list(category::SEGMENT_LOG).unwrap().is_empty());
        assert!(!MetaLog::exists(provider.as_ref()));
    }

    #[test]
    fn pending_drop_is_retried() {
        let provider = Arc::new(InMemoryStoreProvider::new());
        let engine = open(&provider);
        engine.upsert(k("a"), live("1")).unwrap();
        engine.seal_mutable_segment().unwrap();
        engine.merge_read_only_segments().unwrap();
        let first = engine.disk_segment();
        let header = first.id().as_u64();

        let failures = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failures);
        engine.subscribe(EventKind::DiskSegmentDropFailed, move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        provider.pin(header, category::DISK_HEADER);
        engine.upsert(k("b"), live("2")).unwrap();
        engine.seal_mutable_segment().unwrap();
        engine.merge_read_only_segments().unwrap();
        assert!(failures.load(Ordering::SeqCst));
        assert_eq!(engine.retry_pending_drops(), 1);

        provider.unpin(header, category::DISK_HEADER);
        assert_eq!(engine.retry_pending_drops(), 0);
        assert!(first.is_dropped());
        assert!(!provider.exists(header, category::DISK_HEADER));
    }
}
