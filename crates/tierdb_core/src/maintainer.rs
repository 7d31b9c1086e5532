//! Merge scheduling policy.
//!
//! The engine never decides when to merge. A [`Maintainer`] listens to its
//! events and starts background merges once thresholds are reached.

use crate::engine::{Engine, MergeOutcome};
use crate::error::{CoreError, CoreResult};
use crate::events::{EngineEvent, EventKind, SubscriptionId};
use crate::schema::Schema;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maintainer thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintainerOptions {
    /// Read-only segments that trigger a background merge.
    pub threshold_for_merge_operation_start: usize,
    /// Bottom segments that trigger a bottom merge; 0 disables it.
    pub bottom_segments_merge_threshold: usize,
    /// Read buffers idle this long are released by
    /// [`Maintainer::release_caches`].
    pub inactive_block_cache_cleanup_interval_ms: u64,
}

impl Default for MaintainerOptions {
    fn default() -> Self {
        Self {
            threshold_for_merge_operation_start: 2,
            bottom_segments_merge_threshold: 8,
            inactive_block_cache_cleanup_interval_ms: 30_000,
        }
    }
}

impl MaintainerOptions {
    /// Creates options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read-only merge threshold.
    #[must_use]
    pub const fn threshold_for_merge_operation_start(mut self, count: usize) -> Self {
        self.threshold_for_merge_operation_start = count;
        self
    }

    /// Sets the bottom merge threshold.
    #[must_use]
    pub const fn bottom_segments_merge_threshold(mut self, count: usize) -> Self {
        self.bottom_segments_merge_threshold = count;
        self
    }

    /// Sets the read buffer inactivity window.
    #[must_use]
    pub const fn inactive_block_cache_cleanup_interval_ms(mut self, ms: u64) -> Self {
        self.inactive_block_cache_cleanup_interval_ms = ms;
        self
    }
}

type MergeHandle = JoinHandle<CoreResult<MergeOutcome>>;

/// Starts merges in response to engine events.
///
/// Listeners hold the engine weakly; dropping the maintainer unsubscribes
/// them but does not wait for running merges.
pub struct Maintainer<S: Schema> {
    engine: Arc<Engine<S>>,
    options: MaintainerOptions,
    handles: Arc<Mutex<Vec<MergeHandle>>>,
    subscriptions: Vec<SubscriptionId>,
}

impl<S: Schema> Maintainer<S> {
    /// Subscribes a maintainer to `engine`.
    pub fn attach(engine: Arc<Engine<S>>, options: MaintainerOptions) -> Self {
        let handles: Arc<Mutex<Vec<MergeHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let sealed = {
            let weak = Arc::downgrade(&engine);
            let handles = Arc::clone(&handles);
            engine.subscribe(EventKind::MutableSegmentSealed, move |event| {
                if let EngineEvent::MutableSegmentSealed {
                    read_only_count, ..
                } = event
                {
                    if *read_only_count >= options.threshold_for_merge_operation_start {
                        start(&weak, &handles, |e| e.start_merge().map(Some));
                    }
                }
            })
        };

        let merged = {
            let weak = Arc::downgrade(&engine);
            let handles = Arc::clone(&handles);
            engine.subscribe(EventKind::MergeEnded, move |event| {
                let threshold = options.bottom_segments_merge_threshold;
                let succeeded = matches!(
                    event,
                    EngineEvent::MergeEnded {
                        outcome: MergeOutcome::Success
                    }
                );
                if threshold == 0 || !succeeded {
                    return;
                }
                start(&weak, &handles, |e| {
                    let count = e.bottom_segments_count();
                    if count >= threshold.max(2) {
                        e.start_bottom_segments_merge(0, count - 1).map(Some)
                    } else {
                        Ok(None)
                    }
                });
            })
        };

        Self {
            engine,
            options,
            handles,
            subscriptions: vec![sealed, merged],
        }
    }

    /// The maintained engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine<S>> {
        &self.engine
    }

    /// The options in effect.
    #[must_use]
    pub fn options(&self) -> &MaintainerOptions {
        &self.options
    }

    /// Seals the mutable segment and merges every read-only segment into
    /// the disk tier before returning.
    pub fn evict_to_disk(&self) -> CoreResult<()> {
        self.engine.seal_mutable_segment()?;
        loop {
            match self.engine.merge_read_only_segments()? {
                MergeOutcome::AlreadyRunning => {
                    self.wait_for_background_threads()?;
                    thread::sleep(Duration::from_millis(1));
                }
                MergeOutcome::Cancelled => {
                    return Err(CoreError::invalid_operation("eviction merge was cancelled"))
                }
                MergeOutcome::Success | MergeOutcome::NothingToMerge | MergeOutcome::Failed => {
                    return Ok(())
                }
            }
        }
    }

    /// Joins every background merge, including merges started while
    /// waiting.
    ///
    /// Returns the first merge error.
    pub fn wait_for_background_threads(&self) -> CoreResult<()> {
        let mut first_error = None;
        loop {
            let pending: Vec<MergeHandle> = std::mem::take(&mut *self.handles.lock());
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(CoreError::invalid_operation("merge thread panicked")));
                if let Err(e) = result {
                    warn!(error = %e, "background merge failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Runs the three cache sweeps. Returns the number of released items.
    pub fn release_caches(&self, now: Instant) -> usize {
        let window = Duration::from_millis(self.options.inactive_block_cache_cleanup_interval_ms);
        let older_than = now.checked_sub(window).unwrap_or(now);
        let released = self.engine.release_read_buffers(older_than)
            + self.engine.release_circular_key_cache_records(now)
            + self.engine.release_circular_value_cache_records(now);
        debug!(released, "released inactive caches");
        released
    }

    /// Asks running merges to stop.
    pub fn try_cancel_background_threads(&self) {
        self.engine.request_merge_cancellation();
        self.engine.request_bottom_segments_merge_cancellation();
    }
}

/// Starts a background merge if the engine is still alive.
fn start<S, F>(weak: &Weak<Engine<S>>, handles: &Mutex<Vec<MergeHandle>>, spawn: F)
where
    S: Schema,
    F: FnOnce(&Arc<Engine<S>>) -> CoreResult<Option<MergeHandle>>,
{
    let Some(engine) = weak.upgrade() else {
        return;
    };
    match spawn(&engine) {
        Ok(Some(handle)) => handles.lock().push(handle),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to start background merge"),
    }
}

impl<S: Schema> Drop for Maintainer<S> {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.engine.events().unsubscribe(id);
        }
    }
}

impl<S: Schema> fmt::Debug for Maintainer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Maintainer")
            .field("options", &self.options)
            .field("pending", &self.handles.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::disk::DiskSegmentOptions;
    use crate::schema::{BytesSchema, Deletable};
    use tierdb_storage::InMemoryStoreProvider;

    fn engine(mutable_max: usize) -> Arc<Engine<BytesSchema>> {
        let options = EngineOptions::new()
            .mutable_segment_max_item_count(mutable_max)
            .disk_segment(DiskSegmentOptions::default().compression_block_size(512));
        Engine::open(options, Arc::new(InMemoryStoreProvider::new())).unwrap()
    }

    fn put(engine: &Engine<BytesSchema>, i: u32) {
        engine
            .upsert(
                format!("key{i:04}").into_bytes(),
                Deletable::new(i.to_le_bytes().to_vec()),
            )
            .unwrap();
    }

    #[test]
    fn merges_start_at_threshold() {
        let engine = engine(10);
        let maintainer = Maintainer::attach(
            Arc::clone(&engine),
            MaintainerOptions::new().threshold_for_merge_operation_start(2),
        );

        for i in 0..45 {
            put(&engine, i);
        }
        maintainer.wait_for_background_threads().unwrap();
        maintainer.evict_to_disk().unwrap();

        assert_eq!(engine.read_only_segments_count(), 0);
        assert_eq!(engine.in_memory_record_count(), 0);
        assert_eq!(engine.count().unwrap(), 45);
    }

    #[test]
    fn evict_to_disk_empties_memory() {
        let engine = engine(1_000);
        let maintainer = Maintainer::attach(Arc::clone(&engine), MaintainerOptions::default());
        for i in 0..100 {
            put(&engine, i);
        }

        maintainer.evict_to_disk().unwrap();
        maintainer.wait_for_background_threads().unwrap();

        assert_eq!(engine.in_memory_record_count(), 0);
        assert_eq!(engine.disk_segment_record_count(), 100);
    }

    #[test]
    fn release_caches_sweeps_disk_segment() {
        let engine = engine(1_000);
        let maintainer = Maintainer::attach(
            Arc::clone(&engine),
            MaintainerOptions::new().inactive_block_cache_cleanup_interval_ms(0),
        );
        for i in 0..20 {
            put(&engine, i);
        }
        maintainer.evict_to_disk().unwrap();

        assert!(engine.get(&b"key0003".to_vec()).unwrap().is_some());
        let later = Instant::now() + Duration::from_secs(3_600);
        assert!(maintainer.release_caches(later) > 0);
    }

    #[test]
    fn dropping_unsubscribes() {
        let engine = engine(1_000);
        let maintainer = Maintainer::attach(Arc::clone(&engine), MaintainerOptions::default());
        assert_eq!(
            engine.events().listener_count(EventKind::MutableSegmentSealed),
            1
        );
        drop(maintainer);
        assert_eq!(
            engine.events().listener_count(EventKind::MutableSegmentSealed),
            0
        );
        assert_eq!(engine.events().listener_count(EventKind::MergeEnded), 0);
    }
}
