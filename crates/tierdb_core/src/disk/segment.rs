//! Disk segment reader.

use super::cache::CircularCache;
use super::format::{
    decode_header, decompress, split_entries, split_value_payload, BlockHandle, PartFooter,
    BLOCK_HANDLE_SIZE, FOOTER_SIZE,
};
use super::options::{CompressionMethod, DiskSegmentOptions};
use crate::category;
use crate::error::{CoreError, CoreResult};
use crate::events::{EngineEvent, EventBus};
use crate::merge::SegmentEntry;
use crate::schema::{compare_keys, Schema};
use crate::serializer::Serializer;
use crate::types::{OpIndex, SegmentId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierdb_storage::{StorageBackend, StoreProvider};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BlockKind {
    Key,
    Value,
}

type BlockEntries = Arc<Vec<Vec<u8>>>;

/// A decoded block kept for point lookups.
struct ReadBuffer {
    entries: BlockEntries,
    last_access: Instant,
}

struct Part<S: Schema> {
    part_id: u64,
    /// Segment-wide index of the part's first record.
    first_record: u64,
    record_count: u64,
    min_key: S::Key,
    max_key: S::Key,
    backend: Box<dyn StorageBackend>,
    compression: CompressionMethod,
    key_blocks: Vec<BlockHandle>,
    value_blocks: Vec<BlockHandle>,
    sparse: Mutex<Option<Arc<Vec<S::Key>>>>,
    buffers: Mutex<HashMap<(BlockKind, usize), ReadBuffer>>,
}

impl<S: Schema> Part<S> {
    fn open(
        provider: &dyn StoreProvider,
        part_id: u64,
        first_record: u64,
        expected_records: u64,
        min_key: &[u8],
        max_key: &[u8],
    ) -> CoreResult<Self> {
        let backend = provider.open(part_id, category::DISK_PART)?;
        let size = backend.size()?;
        if size < FOOTER_SIZE as u64 {
            return Err(CoreError::segment_corruption(format!(
                "part {part_id} is too short ({size} bytes)"
            )));
        }
        let footer = PartFooter::decode(&backend.read_at(size - FOOTER_SIZE as u64, FOOTER_SIZE)?)?;
        if footer.record_count != expected_records {
            return Err(CoreError::segment_corruption(format!(
                "part {part_id} holds {} records, header says {expected_records}",
                footer.record_count
            )));
        }

        let read_index = |offset: u64, count: u32| -> CoreResult<Vec<BlockHandle>> {
            let data = backend.read_at(offset, count as usize * BLOCK_HANDLE_SIZE)?;
            BlockHandle::decode_all(&data, count as usize)
        };
        let key_blocks = read_index(footer.key_index_offset, footer.key_blocks)?;
        let value_blocks = read_index(footer.value_index_offset, footer.value_blocks)?;

        Ok(Self {
            part_id,
            first_record,
            record_count: footer.record_count,
            min_key: S::KeySerializer::deserialize(min_key)?,
            max_key: S::KeySerializer::deserialize(max_key)?,
            backend,
            compression: footer.compression,
            key_blocks,
            value_blocks,
            sparse: Mutex::new(None),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    fn handles(&self, kind: BlockKind) -> &[BlockHandle] {
        match kind {
            BlockKind::Key => &self.key_blocks,
            BlockKind::Value => &self.value_blocks,
        }
    }

    /// Index of the block holding part-local record `local`.
    fn block_of(&self, kind: BlockKind, local: u64) -> CoreResult<usize> {
        let handles = self.handles(kind);
        let at = handles.partition_point(|h| h.first_record + u64::from(h.record_count) <= local);
        match handles.get(at) {
            Some(h) if h.contains(local) => Ok(at),
            _ => Err(CoreError::segment_corruption(format!(
                "part {} has no block for record {local}",
                self.part_id
            ))),
        }
    }

    /// Reads, verifies and decodes a block.
    fn load_block(&self, kind: BlockKind, block: usize) -> CoreResult<BlockEntries> {
        let handle = self.handles(kind)[block];
        let stored = self
            .backend
            .read_at(handle.offset, handle.stored_len as usize)?;
        let actual = crc32fast::hash(&stored);
        if actual != handle.crc {
            return Err(CoreError::ChecksumMismatch {
                expected: handle.crc,
                actual,
            });
        }
        let raw = decompress(self.compression, &stored)?;
        Ok(Arc::new(split_entries(&raw, handle.record_count as usize)?))
    }

    /// Returns a block through the read buffers.
    fn buffered_block(&self, kind: BlockKind, block: usize) -> CoreResult<BlockEntries> {
        if let Some(buffer) = self.buffers.lock().get_mut(&(kind, block)) {
            buffer.last_access = Instant::now();
            return Ok(Arc::clone(&buffer.entries));
        }
        let entries = self.load_block(kind, block)?;
        self.buffers.lock().insert(
            (kind, block),
            ReadBuffer {
                entries: Arc::clone(&entries),
                last_access: Instant::now(),
            },
        );
        Ok(entries)
    }

    /// Raw payload of part-local record `local`.
    fn payload(&self, kind: BlockKind, local: u64) -> CoreResult<Vec<u8>> {
        let block = self.block_of(kind, local)?;
        let entries = self.buffered_block(kind, block)?;
        let at = (local - self.handles(kind)[block].first_record) as usize;
        Ok(entries[at].clone())
    }

    fn release_buffers(&self, older_than: Instant) -> usize {
        let mut buffers = self.buffers.lock();
        let before = buffers.len();
        buffers.retain(|_, b| b.last_access >= older_than);
        before - buffers.len()
    }
}

/// An immutable, sorted, possibly multi-part segment.
///
/// Point lookups go part (by min/max key) → sparse index → binary search
/// over record indexes → value. Decoded keys and values are kept in two
/// [`CircularCache`]s keyed by record index; decoded blocks are kept as
/// read buffers. Nothing is evicted on the lookup path; the `release_*`
/// sweeps do that.
///
/// Iterators attach to the segment. Once the segment is superseded,
/// [`DiskSegment::drop_segment`] removes its stores as soon as no iterator
/// is attached.
pub struct DiskSegment<S: Schema> {
    id: SegmentId,
    provider: Arc<dyn StoreProvider>,
    parts: Vec<Part<S>>,
    len: usize,
    sparse_step: usize,
    key_cache: CircularCache<S::Key>,
    value_cache: CircularCache<(S::Value, OpIndex)>,
    events: Arc<EventBus>,
    attached: AtomicUsize,
    drop_requested: AtomicBool,
    dropped: AtomicBool,
    drop_lock: Mutex<()>,
}

impl<S: Schema> DiskSegment<S> {
    fn with_parts(
        id: SegmentId,
        provider: Arc<dyn StoreProvider>,
        parts: Vec<Part<S>>,
        options: DiskSegmentOptions,
        events: Arc<EventBus>,
    ) -> Self {
        let len = parts.iter().map(|p| p.record_count as usize).sum();
        Self {
            id,
            provider,
            parts,
            len,
            sparse_step: options.sparse_index_step,
            key_cache: CircularCache::new(
                options.key_cache_size,
                Duration::from_millis(options.key_cache_record_lifetime_ms),
            ),
            value_cache: CircularCache::new(
                options.value_cache_size,
                Duration::from_millis(options.value_cache_record_lifetime_ms),
            ),
            events,
            attached: AtomicUsize::new(0),
            drop_requested: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
            drop_lock: Mutex::new(()),
        }
    }

    /// The segment that stands in before any merge produced one.
    #[must_use]
    pub fn empty(
        provider: Arc<dyn StoreProvider>,
        options: DiskSegmentOptions,
        events: Arc<EventBus>,
    ) -> Self {
        Self::with_parts(SegmentId::EMPTY, provider, Vec::new(), options, events)
    }

    /// Opens a completed segment.
    ///
    /// Opening [`SegmentId::EMPTY`] returns the empty segment.
    pub fn open(
        provider: Arc<dyn StoreProvider>,
        id: SegmentId,
        options: DiskSegmentOptions,
        events: Arc<EventBus>,
    ) -> CoreResult<Self> {
        if id == SegmentId::EMPTY {
            return Ok(Self::empty(provider, options, events));
        }

        let header = provider.open(id.as_u64(), category::DISK_HEADER)?.read_all()?;
        let infos = decode_header(&header)?;

        let mut parts = Vec::with_capacity(infos.len());
        let mut first_record = 0u64;
        for info in &infos {
            let part = Part::open(
                provider.as_ref(),
                info.part_id,
                first_record,
                info.record_count,
                &info.min_key,
                &info.max_key,
            )?;
            first_record += part.record_count;
            parts.push(part);
        }

        debug!(segment_id = %id, parts = parts.len(), records = first_record, "opened disk segment");
        Ok(Self::with_parts(id, provider, parts, options, events))
    }

    /// Segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Number of records, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the segment holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of parts.
    #[must_use]
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Ids of the part stores, in key order.
    #[must_use]
    pub fn part_ids(&self) -> Vec<u64> {
        self.parts.iter().map(|p| p.part_id).collect()
    }

    /// Smallest key.
    pub fn min_key(&self) -> Option<&S::Key> {
        self.parts.first().map(|p| &p.min_key)
    }

    /// Largest key.
    pub fn max_key(&self) -> Option<&S::Key> {
        self.parts.last().map(|p| &p.max_key)
    }

    fn read_key(&self, part: &Part<S>, local: u64) -> CoreResult<S::Key> {
        let global = part.first_record + local;
        if let Some(key) = self.key_cache.get(global) {
            return Ok(key);
        }
        let key = S::KeySerializer::deserialize(&part.payload(BlockKind::Key, local)?)?;
        self.key_cache.insert(global, key.clone());
        Ok(key)
    }

    fn read_value(&self, part: &Part<S>, local: u64) -> CoreResult<(S::Value, OpIndex)> {
        let global = part.first_record + local;
        if let Some(value) = self.value_cache.get(global) {
            return Ok(value);
        }
        let payload = part.payload(BlockKind::Value, local)?;
        let (op_index, bytes) = split_value_payload(&payload)?;
        let value = (S::ValueSerializer::deserialize(bytes)?, op_index);
        self.value_cache.insert(global, value.clone());
        Ok(value)
    }

    /// Sampled keys of a part, built on first use.
    fn sparse_index(&self, part: &Part<S>) -> CoreResult<Arc<Vec<S::Key>>> {
        let mut slot = part.sparse.lock();
        if let Some(index) = slot.as_ref() {
            return Ok(Arc::clone(index));
        }
        let step = self.sparse_step as u64;
        let mut samples = Vec::with_capacity((part.record_count / step + 1) as usize);
        let mut local = 0;
        while local < part.record_count {
            samples.push(self.read_key(part, local)?);
            local += step;
        }
        let index = Arc::new(samples);
        *slot = Some(Arc::clone(&index));
        Ok(index)
    }

    /// Part-local index of `key`, if present.
    fn find_in_part(&self, part: &Part<S>, key: &S::Key) -> CoreResult<Option<u64>> {
        let (mut lo, mut hi) = (0u64, part.record_count);

        if self.sparse_step > 0 {
            let step = self.sparse_step as u64;
            let samples = self.sparse_index(part)?;
            let below = samples.partition_point(|s| compare_keys::<S>(s, key).is_le());
            if below == 0 {
                return Ok(None);
            }
            let sample = (below - 1) as u64;
            if compare_keys::<S>(&samples[below - 1], key).is_eq() {
                return Ok(Some(sample * step));
            }
            lo = sample * step + 1;
            hi = hi.min((sample + 1) * step);
        }

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match compare_keys::<S>(&self.read_key(part, mid)?, key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Some(mid)),
            }
        }
        Ok(None)
    }

    /// Looks up `key`, returning its value (possibly a tombstone) and
    /// operation index.
    pub fn get(&self, key: &S::Key) -> CoreResult<Option<(S::Value, OpIndex)>> {
        let at = self
            .parts
            .partition_point(|p| compare_keys::<S>(&p.max_key, key).is_lt());
        let Some(part) = self.parts.get(at) else {
            return Ok(None);
        };
        if compare_keys::<S>(key, &part.min_key).is_lt() {
            return Ok(None);
        }
        match self.find_in_part(part, key)? {
            Some(local) => self.read_value(part, local).map(Some),
            None => Ok(None),
        }
    }

    /// Ordered iterator over every record. Attaches to the segment until
    /// dropped.
    pub fn iter(self: &Arc<Self>) -> DiskSegmentIter<S> {
        self.attach_iterator();
        DiskSegmentIter {
            segment: Arc::clone(self),
            part: 0,
            local: 0,
            keys: None,
            values: None,
            failed: false,
        }
    }

    /// Reads every record, checking block checksums and key order.
    ///
    /// Returns the number of records.
    pub fn verify(self: &Arc<Self>) -> CoreResult<usize> {
        let mut count = 0;
        let mut last: Option<S::Key> = None;
        for entry in self.iter() {
            let entry = entry?;
            if let Some(prev) = &last {
                if !compare_keys::<S>(prev, &entry.key).is_lt() {
                    return Err(CoreError::segment_corruption(format!(
                        "segment {} keys out of order at record {count}",
                        self.id
                    )));
                }
            }
            last = Some(entry.key);
            count += 1;
        }
        if count != self.len {
            return Err(CoreError::segment_corruption(format!(
                "segment {} yielded {count} records, expected {}",
                self.id, self.len
            )));
        }
        Ok(count)
    }

    /// Drops decoded blocks not accessed since `older_than`.
    pub fn release_read_buffers(&self, older_than: Instant) -> usize {
        self.parts.iter().map(|p| p.release_buffers(older_than)).sum()
    }

    /// Drops key cache entries idle longer than their lifetime at `now`.
    pub fn release_circular_key_cache_records(&self, now: Instant) -> usize {
        self.key_cache.release_expired(now)
    }

    /// Drops value cache entries idle longer than their lifetime at `now`.
    pub fn release_circular_value_cache_records(&self, now: Instant) -> usize {
        self.value_cache.release_expired(now)
    }

    /// Registers an iterator. Returns the new count.
    pub fn attach_iterator(&self) -> usize {
        self.attached.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Unregisters an iterator, performing a pending drop when it was the
    /// last one. Returns the new count.
    pub fn detach_iterator(&self) -> usize {
        let remaining = self.attached.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 && self.is_drop_requested() {
            self.remove_stores();
        }
        remaining
    }

    /// Number of attached iterators.
    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    /// Marks the segment superseded and removes its stores once no
    /// iterator is attached.
    ///
    /// A failed removal fires [`EngineEvent::DiskSegmentDropFailed`];
    /// calling this again retries it. Returns true once the stores are gone.
    pub fn drop_segment(&self) -> bool {
        self.drop_requested.store(true, Ordering::SeqCst);
        if self.attached.load(Ordering::SeqCst) == 0 {
            self.remove_stores();
        }
        self.is_dropped()
    }

    /// Returns true once the stores have been removed.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Returns true once the segment has been superseded.
    #[must_use]
    pub fn is_drop_requested(&self) -> bool {
        self.drop_requested.load(Ordering::SeqCst)
    }

    fn remove_stores(&self) {
        let _guard = self.drop_lock.lock();
        if self.is_dropped() || self.id == SegmentId::EMPTY {
            self.dropped.store(true, Ordering::SeqCst);
            return;
        }

        let result = self
            .parts
            .iter()
            .try_for_each(|p| self.provider.remove(p.part_id, category::DISK_PART))
            .and_then(|()| {
                self.provider
                    .remove(self.id.as_u64(), category::DISK_HEADER)
            });

        match result {
            Ok(()) => {
                self.dropped.store(true, Ordering::SeqCst);
                debug!(segment_id = %self.id, "dropped disk segment");
            }
            Err(e) => {
                warn!(segment_id = %self.id, error = %e, "failed to drop disk segment");
                self.events.emit(&EngineEvent::DiskSegmentDropFailed {
                    segment_id: self.id,
                    error: e.to_string(),
                });
            }
        }
    }
}

impl<S: Schema> fmt::Debug for DiskSegment<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskSegment")
            .field("id", &self.id)
            .field("parts", &self.parts.len())
            .field("len", &self.len)
            .field("attached", &self.attached_count())
            .field("drop_requested", &self.is_drop_requested())
            .field("dropped", &self.is_dropped())
            .finish()
    }
}

/// Ordered cursor over a [`DiskSegment`].
///
/// Reads blocks directly, bypassing the read buffers and caches.
pub struct DiskSegmentIter<S: Schema> {
    segment: Arc<DiskSegment<S>>,
    part: usize,
    local: u64,
    keys: Option<(usize, BlockEntries)>,
    values: Option<(usize, BlockEntries)>,
    failed: bool,
}

impl<S: Schema> DiskSegmentIter<S> {
    fn entry_at(
        part: &Part<S>,
        kind: BlockKind,
        local: u64,
        current: &mut Option<(usize, BlockEntries)>,
    ) -> CoreResult<Vec<u8>> {
        let block = part.block_of(kind, local)?;
        let loaded = match current {
            Some((b, entries)) if *b == block => Arc::clone(entries),
            _ => {
                let entries = part.load_block(kind, block)?;
                *current = Some((block, Arc::clone(&entries)));
                entries
            }
        };
        let at = (local - part.handles(kind)[block].first_record) as usize;
        Ok(loaded[at].clone())
    }

    fn read_next(&mut self) -> CoreResult<Option<SegmentEntry<S::Key, S::Value>>> {
        let segment = Arc::clone(&self.segment);
        loop {
            let Some(part) = segment.parts.get(self.part) else {
                return Ok(None);
            };
            if self.local >= part.record_count {
                self.part += 1;
                self.local = 0;
                self.keys = None;
                self.values = None;
                continue;
            }

            let key_bytes = Self::entry_at(part, BlockKind::Key, self.local, &mut self.keys)?;
            let value_payload =
                Self::entry_at(part, BlockKind::Value, self.local, &mut self.values)?;
            self.local += 1;

            let (op_index, value_bytes) = split_value_payload(&value_payload)?;
            return Ok(Some(SegmentEntry::new(
                S::KeySerializer::deserialize(&key_bytes)?,
                S::ValueSerializer::deserialize(value_bytes)?,
                op_index,
            )));
        }
    }
}

impl<S: Schema> Iterator for DiskSegmentIter<S> {
    type Item = CoreResult<SegmentEntry<S::Key, S::Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl<S: Schema> Drop for DiskSegmentIter<S> {
    fn drop(&mut self) {
        self.segment.detach_iterator();
    }
}

impl<S: Schema> fmt::Debug for DiskSegmentIter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskSegmentIter")
            .field("segment", &self.segment.id)
            .field("part", &self.part)
            .field("local", &self.local)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskSegmentMode, DiskSegmentWriter};
    use crate::events::EventKind;
    use crate::schema::{Deletable, DeletableMarker, OrdComparator};
    use crate::serializer::{DeletableSerializer, StringSerializer, U64Serializer};
    use crate::types::IdProvider;
    use tierdb_storage::InMemoryStoreProvider;

    struct Numbers;

    impl Schema for Numbers {
        type Key = u64;
        type Value = Deletable<String>;
        type Comparator = OrdComparator;
        type KeySerializer = U64Serializer;
        type ValueSerializer = DeletableSerializer<StringSerializer>;
        type Deletion = DeletableMarker;
    }

    struct Fixture {
        provider: Arc<InMemoryStoreProvider>,
        ids: Arc<IdProvider>,
        events: Arc<EventBus>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                provider: Arc::new(InMemoryStoreProvider::new()),
                ids: Arc::new(IdProvider::starting_after(100)),
                events: Arc::new(EventBus::new()),
            }
        }

        fn write(&self, id: u64, keys: &[u64], options: DiskSegmentOptions) -> Arc<DiskSegment<Numbers>> {
            let mut writer = DiskSegmentWriter::<Numbers>::new(
                self.provider.clone(),
                SegmentId::new(id),
                self.ids.clone(),
                options,
                self.events.clone(),
            )
            .unwrap();
            for &k in keys {
                writer
                    .append(&k, &Deletable::new(format!("v{k}")), OpIndex::new(k))
                    .unwrap();
            }
            Arc::new(writer.complete().unwrap())
        }
    }

    fn small_options() -> DiskSegmentOptions {
        DiskSegmentOptions::default()
            .compression_block_size(64)
            .records_per_part(5, 10)
            .sparse_index_step(4)
    }

    #[test]
    fn point_lookups_across_parts_and_blocks() {
        let fx = Fixture::new();
        let keys: Vec<u64> = (0..35).map(|k| k * 2).collect();
        let segment = fx.write(1, &keys, small_options());

        assert_eq!(segment.len(), 35);
        assert_eq!(segment.part_count(), 4);
        assert_eq!(segment.min_key(), Some(&0));
        assert_eq!(segment.max_key(), Some(&68));

        for &k in &keys {
            let (value, op) = segment.get(&k).unwrap().unwrap();
            assert_eq!(value.value, format!("v{k}"));
            assert_eq!(op, OpIndex::new(k));
        }
        for missing in [1, 33, 69, 1000] {
            assert!(segment.get(&missing).unwrap().is_none());
        }
    }

    #[test]
    fn lookups_work_for_every_sparse_step() {
        let fx = Fixture::new();
        let keys: Vec<u64> = (10..50).collect();
        for step in [0, 1, 3, 64] {
            let options = small_options().sparse_index_step(step);
            let segment = fx.write(step as u64 + 1, &keys, options);
            for &k in &keys {
                assert!(segment.get(&k).unwrap().is_some(), "step {step} key {k}");
            }
            assert!(segment.get(&9).unwrap().is_none());
            assert!(segment.get(&50).unwrap().is_none());
        }
    }

    #[test]
    fn reopen_and_iterate_in_order() {
        let fx = Fixture::new();
        let keys: Vec<u64> = (0..23).collect();
        let options = small_options().compression_method(CompressionMethod::None);
        drop(fx.write(7, &keys, options));

        let reopened = Arc::new(
            DiskSegment::<Numbers>::open(fx.provider.clone(), SegmentId::new(7), options, fx.events.clone())
                .unwrap(),
        );
        let seen: Vec<u64> = reopened.iter().map(|e| e.unwrap().key).collect();
        assert_eq!(seen, keys);
        assert_eq!(reopened.verify().unwrap(), 23);
        assert_eq!(reopened.attached_count(), 0);
    }

    #[test]
    fn single_part_mode_never_splits() {
        let fx = Fixture::new();
        let keys: Vec<u64> = (0..40).collect();
        let segment = fx.write(2, &keys, small_options().mode(DiskSegmentMode::SinglePart));
        assert_eq!(segment.part_count(), 1);
        assert_eq!(segment.len(), 40);
    }

    #[test]
    fn writer_rejects_unsorted_keys() {
        let fx = Fixture::new();
        let mut writer = DiskSegmentWriter::<Numbers>::new(
            fx.provider.clone(),
            SegmentId::new(3),
            fx.ids.clone(),
            small_options(),
            fx.events.clone(),
        )
        .unwrap();
        writer.append(&5, &Deletable::new("a".into()), OpIndex::new(1)).unwrap();
        assert!(writer.append(&5, &Deletable::new("b".into()), OpIndex::new(2)).is_err());
        assert!(writer.append(&4, &Deletable::new("c".into()), OpIndex::new(3)).is_err());

        writer.abandon().unwrap();
        assert!(fx.provider.list(category::DISK_PART).unwrap().is_empty());
        assert!(!fx.provider.exists(3, category::DISK_HEADER));
    }

    #[test]
    fn empty_segment() {
        let fx = Fixture::new();
        let empty = Arc::new(DiskSegment::<Numbers>::empty(
            fx.provider.clone(),
            DiskSegmentOptions::default(),
            fx.events.clone(),
        ));
        assert!(empty.is_empty());
        assert_eq!(empty.id(), SegmentId::EMPTY);
        assert!(empty.get(&1).unwrap().is_none());
        assert_eq!(empty.iter().count(), 0);
        assert!(empty.drop_segment());
    }

    #[test]
    fn drop_waits_for_attached_iterators() {
        let fx = Fixture::new();
        let segment = fx.write(4, &[1, 2, 3], small_options());

        let mut iter = segment.iter();
        assert_eq!(iter.next().unwrap().unwrap().key, 1);

        assert!(!segment.drop_segment());
        assert!(fx.provider.exists(4, category::DISK_HEADER));

        // Still readable while superseded.
        assert_eq!(iter.next().unwrap().unwrap().key, 2);
        drop(iter);

        assert!(segment.is_dropped());
        assert!(!fx.provider.exists(4, category::DISK_HEADER));
        assert!(fx.provider.list(category::DISK_PART).unwrap().is_empty());
    }

    #[test]
    fn failed_drop_fires_event_and_can_retry() {
        let fx = Fixture::new();
        let segment = fx.write(5, &[1, 2], small_options());
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        fx.events.subscribe(EventKind::DiskSegmentDropFailed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        fx.provider.pin(5, category::DISK_HEADER);
        assert!(!segment.drop_segment());
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        fx.provider.unpin(5, category::DISK_HEADER);
        assert!(segment.drop_segment());
        assert!(!fx.provider.exists(5, category::DISK_HEADER));
    }

    #[test]
    fn release_sweeps_evict_idle_entries() {
        let fx = Fixture::new();
        let options = small_options().cache_record_lifetime_ms(10, 10);
        let segment = fx.write(6, &(0..20).collect::<Vec<_>>(), options);
        for k in 0..20 {
            segment.get(&k).unwrap();
        }

        let later = Instant::now() + Duration::from_secs(1);
        assert!(segment.release_circular_key_cache_records(later) > 0);
        assert!(segment.release_circular_value_cache_records(later) > 0);
        assert!(segment.release_read_buffers(later) > 0);
        assert_eq!(segment.release_read_buffers(later), 0);

        // Lookups reload what was released.
        assert_eq!(segment.get(&7).unwrap().unwrap().0.value, "v7");
    }

    #[test]
    fn corrupted_block_is_detected() {
        let fx = Fixture::new();
        let segment = fx.write(8, &(0..10).collect::<Vec<_>>(), small_options());
        let part_id = segment.part_ids()[0];
        assert!(fx.provider.raw(part_id, category::DISK_PART).unwrap().corrupt_byte(2));

        let fresh = Arc::new(
            DiskSegment::<Numbers>::open(fx.provider.clone(), SegmentId::new(8), small_options(), fx.events.clone())
                .unwrap(),
        );
        assert!(matches!(
            fresh.get(&0),
            Err(CoreError::ChecksumMismatch { .. })
        ));
        assert!(fresh.verify().is_err());
    }
}
