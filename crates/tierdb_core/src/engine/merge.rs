//! Read-only and bottom segment merges.
//!
//! A read-only merge folds every queued read-only segment and the current
//! disk segment into a new disk segment. A bottom merge folds a contiguous
//! range of bottom segments into one. Both write the new segment without
//! holding any topology lock, then publish it under the short and update
//! locks. Superseded segments are dropped after publication; disk segments
//! wait for their attached iterators.

use super::{memory_cursors, Engine};
use crate::disk::{DiskSegment, DiskSegmentWriter};
use crate::error::{CoreError, CoreResult};
use crate::events::EngineEvent;
use crate::merge::{MergeIterator, SegmentCursor};
use crate::schema::{is_deleted, Schema};
use crate::types::SegmentId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// How a merge finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new segment was published.
    Success,
    /// Cancellation was requested; nothing was published.
    Cancelled,
    /// There was nothing to merge.
    NothingToMerge,
    /// A merge of the same kind was already running.
    AlreadyRunning,
    /// The merge stopped on an error; nothing was published.
    Failed,
}

/// Clears a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a merge drops from its output.
#[derive(Clone, Copy)]
enum Tombstones {
    Keep,
    Drop,
}

impl<S: Schema> Engine<S> {
    /// Merges every read-only segment and the disk segment into a new disk
    /// segment.
    ///
    /// Tombstones are dropped when there are no bottom segments they could
    /// shadow. A merged segment that reaches `disk_segment_max_item_count`
    /// moves to the bottom tier and an empty disk segment takes its place.
    ///
    /// Only one read-only merge runs at a time; a concurrent call returns
    /// [`MergeOutcome::AlreadyRunning`].
    pub fn merge_read_only_segments(&self) -> CoreResult<MergeOutcome> {
        let Some(_running) = self.merge_lock.try_lock() else {
            return Ok(MergeOutcome::AlreadyRunning);
        };
        if self.is_closed() {
            return Ok(MergeOutcome::Cancelled);
        }
        let _flag = FlagGuard::raise(&self.merging);
        self.cancel_merge.store(false, Ordering::SeqCst);

        self.events.emit(&EngineEvent::MergeStarted);
        let result = self.run_read_only_merge();
        let outcome = *result.as_ref().unwrap_or(&MergeOutcome::Failed);
        match &result {
            Ok(outcome) => info!(?outcome, "read-only merge ended"),
            Err(e) => warn!(error = %e, "read-only merge failed"),
        }
        self.events.emit(&EngineEvent::MergeEnded { outcome });
        result
    }

    fn run_read_only_merge(&self) -> CoreResult<MergeOutcome> {
        let read_only = self.read_only.snapshot();
        if read_only.is_empty() {
            return Ok(MergeOutcome::NothingToMerge);
        }
        let disk = self.disk.load_full();
        // Bottom segments only appear through this merge, which is serialized.
        let tombstones = if self.bottom.is_empty() {
            Tombstones::Drop
        } else {
            Tombstones::Keep
        };

        let mut sources = memory_cursors(&read_only);
        sources.push(Box::new(disk.iter()));

        debug!(
            read_only_segments = read_only.len(),
            disk_segment = %disk.id(),
            "merging read-only segments"
        );
        let Some(merged) = self.write_segment(sources, tombstones, &self.cancel_merge)? else {
            return Ok(MergeOutcome::Cancelled);
        };
        let merged = Arc::new(merged);
        let merged_id = merged.id();
        let to_bottom = merged.len() >= self.options.disk_segment_max_item_count;

        let merged_ids: HashSet<SegmentId> = read_only.iter().map(|s| s.id()).collect();
        let saved = {
            let _short = self.short_lock.lock();
            let _update = self.update_lock.lock();
            if to_bottom {
                self.bottom.enqueue(Arc::clone(&merged));
                self.disk.store(Arc::new(DiskSegment::empty(
                    Arc::clone(&self.provider),
                    self.options.disk_segment,
                    Arc::clone(&self.events),
                )));
            } else {
                self.disk.store(Arc::clone(&merged));
            }
            self.read_only.remove_where(|s| merged_ids.contains(&s.id()));
            self.meta
                .save(&self.current_meta(self.mutable.load().id()))
        };

        info!(
            segment_id = %merged_id,
            records = merged.len(),
            bottom = to_bottom,
            "published merged disk segment"
        );
        self.events.emit(&EngineEvent::DiskSegmentActivated {
            segment_id: merged_id,
        });

        // Only drop superseded stores once the new topology is durable.
        saved?;
        self.drop_read_only_logs(&read_only);
        self.retire(disk);
        Ok(MergeOutcome::Success)
    }

    /// Merges the bottom segments at positions `from..=to` (newest first)
    /// into one.
    ///
    /// Tombstones are dropped when the range includes the oldest bottom
    /// segment. Ranges of fewer than two segments have nothing to merge.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the range is out of bounds.
    pub fn merge_bottom_segments(&self, from: usize, to: usize) -> CoreResult<MergeOutcome> {
        let Some(_running) = self.bottom_merge_lock.try_lock() else {
            return Ok(MergeOutcome::AlreadyRunning);
        };
        if self.is_closed() {
            return Ok(MergeOutcome::Cancelled);
        }
        let _flag = FlagGuard::raise(&self.bottom_merging);
        self.cancel_bottom_merge.store(false, Ordering::SeqCst);

        self.events.emit(&EngineEvent::BottomSegmentsMergeStarted);
        let result = self.run_bottom_merge(from, to);
        let outcome = *result.as_ref().unwrap_or(&MergeOutcome::Failed);
        match &result {
            Ok(outcome) => info!(?outcome, from, to, "bottom segments merge ended"),
            Err(e) => warn!(error = %e, from, to, "bottom segments merge failed"),
        }
        self.events
            .emit(&EngineEvent::BottomSegmentsMergeEnded { outcome });
        result
    }

    fn run_bottom_merge(&self, from: usize, to: usize) -> CoreResult<MergeOutcome> {
        let bottom = self.bottom.snapshot();
        if from > to || to >= bottom.len() {
            return Err(CoreError::invalid_operation(format!(
                "bottom segment range {from}..={to} is out of bounds for {} segments",
                bottom.len()
            )));
        }
        if from == to {
            return Ok(MergeOutcome::NothingToMerge);
        }

        let inputs = bottom[from..=to].to_vec();
        // Only the newest end of the queue grows concurrently.
        let tombstones = if to == bottom.len() - 1 {
            Tombstones::Drop
        } else {
            Tombstones::Keep
        };
        let sources: Vec<SegmentCursor<'static, S::Key, S::Value>> = inputs
            .iter()
            .map(|s| Box::new(s.iter()) as SegmentCursor<'static, _, _>)
            .collect();

        debug!(segments = inputs.len(), from, to, "merging bottom segments");
        let Some(merged) = self.write_segment(sources, tombstones, &self.cancel_bottom_merge)?
        else {
            return Ok(MergeOutcome::Cancelled);
        };
        let merged = Arc::new(merged);
        let merged_id = merged.id();
        let input_ids: Vec<SegmentId> = inputs.iter().map(|s| s.id()).collect();

        let saved = {
            let _short = self.short_lock.lock();
            let _update = self.update_lock.lock();

            // A read-only merge may have queued newer segments since the
            // snapshot, shifting positions.
            let current: Vec<SegmentId> = self.bottom.snapshot().iter().map(|s| s.id()).collect();
            let start = current.iter().position(|id| *id == input_ids[0]);
            let contiguous = start.is_some_and(|start| {
                current.get(start..start + input_ids.len()) == Some(input_ids.as_slice())
            });
            let replaced = match start {
                Some(start) if contiguous => self.bottom.replace_range(
                    start,
                    start + input_ids.len() - 1,
                    Arc::clone(&merged),
                ),
                _ => None,
            };
            if replaced.is_none() {
                None
            } else {
                Some(
                    self.meta
                        .save(&self.current_meta(self.mutable.load().id())),
                )
            }
        };

        let Some(saved) = saved else {
            // The queue no longer matches the merged range.
            self.retire(merged);
            return Err(CoreError::invalid_operation(
                "bottom segments changed during merge",
            ));
        };

        info!(segment_id = %merged_id, records = merged.len(), "published merged bottom segment");
        self.events.emit(&EngineEvent::DiskSegmentActivated {
            segment_id: merged_id,
        });

        saved?;
        for segment in inputs {
            self.retire(segment);
        }
        Ok(MergeOutcome::Success)
    }

    /// Streams merged `sources` into a new disk segment.
    ///
    /// Returns `None` if `cancel` was raised, after removing the partial
    /// segment.
    fn write_segment(
        &self,
        sources: Vec<SegmentCursor<'static, S::Key, S::Value>>,
        tombstones: Tombstones,
        cancel: &AtomicBool,
    ) -> CoreResult<Option<DiskSegment<S>>> {
        let segment_id = SegmentId::new(self.segment_ids.next_id());
        let mut writer = DiskSegmentWriter::<S>::new(
            Arc::clone(&self.provider),
            segment_id,
            Arc::clone(&self.segment_ids),
            self.options.disk_segment,
            Arc::clone(&self.events),
        )?;

        let written = fill(&mut writer, sources, tombstones, cancel);

        match written {
            Ok(true) => {
                let segment = writer.complete()?;
                info!(segment_id = %segment_id, records = segment.len(), "created disk segment");
                self.events
                    .emit(&EngineEvent::DiskSegmentCreated { segment_id });
                Ok(Some(segment))
            }
            Ok(false) => {
                debug!(
                    segment_id = %writer.segment_id(),
                    records_written = writer.record_count(),
                    "merge cancelled"
                );
                // A failed removal is reported through the event bus.
                let _ = writer.abandon();
                Ok(None)
            }
            Err(e) => {
                let _ = writer.abandon();
                Err(e)
            }
        }
    }

    /// Runs [`Engine::merge_read_only_segments`] on a background thread.
    pub fn start_merge(self: &Arc<Self>) -> CoreResult<JoinHandle<CoreResult<MergeOutcome>>> {
        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("tierdb-merge".into())
            .spawn(move || engine.merge_read_only_segments())?;
        Ok(handle)
    }

    /// Runs [`Engine::merge_bottom_segments`] on a background thread.
    pub fn start_bottom_segments_merge(
        self: &Arc<Self>,
        from: usize,
        to: usize,
    ) -> CoreResult<JoinHandle<CoreResult<MergeOutcome>>> {
        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("tierdb-bottom-merge".into())
            .spawn(move || engine.merge_bottom_segments(from, to))?;
        Ok(handle)
    }

    /// Asks a running read-only merge to stop.
    pub fn request_merge_cancellation(&self) {
        self.cancel_merge.store(true, Ordering::SeqCst);
    }

    /// Asks a running bottom merge to stop.
    pub fn request_bottom_segments_merge_cancellation(&self) {
        self.cancel_bottom_merge.store(true, Ordering::SeqCst);
    }

    /// Returns true while a read-only merge runs.
    #[must_use]
    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::SeqCst)
    }

    /// Returns true while a bottom merge runs.
    #[must_use]
    pub fn is_bottom_segments_merging(&self) -> bool {
        self.bottom_merging.load(Ordering::SeqCst)
    }
}

/// Appends the merged entries to `writer`. Returns false if cancelled.
fn fill<S: Schema>(
    writer: &mut DiskSegmentWriter<S>,
    sources: Vec<SegmentCursor<'static, S::Key, S::Value>>,
    tombstones: Tombstones,
    cancel: &AtomicBool,
) -> CoreResult<bool> {
    for entry in MergeIterator::<S>::new(sources)? {
        if cancel.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let entry = entry?;
        if matches!(tombstones, Tombstones::Drop) && is_deleted::<S>(&entry.value) {
            continue;
        }
        writer.append(&entry.key, &entry.value, entry.op_index)?;
    }
    Ok(true)
}
