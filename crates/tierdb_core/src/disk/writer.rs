//! Disk segment writer.

use super::format::{
    compress, encode_header, push_entry, value_payload, BlockHandle, PartFooter, PartInfo,
};
use super::options::{CompressionMethod, DiskSegmentMode, DiskSegmentOptions};
use super::segment::DiskSegment;
use crate::category;
use crate::error::{CoreError, CoreResult};
use crate::events::{EngineEvent, EventBus};
use crate::schema::{compare_keys, Schema};
use crate::serializer::Serializer;
use crate::types::{IdProvider, OpIndex, SegmentId};
use std::fmt;
use std::sync::Arc;
use tierdb_storage::{StorageBackend, StoreProvider};
use tracing::{debug, warn};

/// One block being filled.
#[derive(Default)]
struct OpenBlock {
    raw: Vec<u8>,
    first_record: u64,
    record_count: u32,
}

/// Streams one part store.
struct PartWriter {
    part_id: u64,
    backend: Box<dyn StorageBackend>,
    compression: CompressionMethod,
    block_size: usize,
    keys: OpenBlock,
    values: OpenBlock,
    key_handles: Vec<BlockHandle>,
    value_handles: Vec<BlockHandle>,
    record_count: u64,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
}

impl PartWriter {
    fn new(
        part_id: u64,
        backend: Box<dyn StorageBackend>,
        options: &DiskSegmentOptions,
    ) -> Self {
        Self {
            part_id,
            backend,
            compression: options.compression_method,
            block_size: options.compression_block_size,
            keys: OpenBlock::default(),
            values: OpenBlock::default(),
            key_handles: Vec::new(),
            value_handles: Vec::new(),
            record_count: 0,
            min_key: Vec::new(),
            max_key: Vec::new(),
        }
    }

    fn append(&mut self, key: Vec<u8>, value: &[u8], op_index: OpIndex) -> CoreResult<()> {
        push_entry(&mut self.keys.raw, &key)?;
        self.keys.record_count += 1;
        push_entry(&mut self.values.raw, &value_payload(op_index, value))?;
        self.values.record_count += 1;

        if self.record_count == 0 {
            self.min_key.clone_from(&key);
        }
        self.max_key = key;
        self.record_count += 1;

        if self.keys.raw.len() >= self.block_size {
            flush_block(
                &mut *self.backend,
                self.compression,
                &mut self.keys,
                &mut self.key_handles,
                self.record_count,
            )?;
        }
        if self.values.raw.len() >= self.block_size {
            flush_block(
                &mut *self.backend,
                self.compression,
                &mut self.values,
                &mut self.value_handles,
                self.record_count,
            )?;
        }
        Ok(())
    }

    fn finish(mut self) -> CoreResult<PartInfo> {
        let next = self.record_count;
        flush_block(
            &mut *self.backend,
            self.compression,
            &mut self.keys,
            &mut self.key_handles,
            next,
        )?;
        flush_block(
            &mut *self.backend,
            self.compression,
            &mut self.values,
            &mut self.value_handles,
            next,
        )?;

        let mut index = Vec::new();
        for handle in &self.key_handles {
            handle.encode_into(&mut index);
        }
        let key_index_offset = self.backend.append(&index)?;

        index.clear();
        for handle in &self.value_handles {
            handle.encode_into(&mut index);
        }
        let value_index_offset = self.backend.append(&index)?;

        let footer = PartFooter {
            key_index_offset,
            key_blocks: block_count(self.key_handles.len())?,
            value_index_offset,
            value_blocks: block_count(self.value_handles.len())?,
            record_count: self.record_count,
            compression: self.compression,
        };
        self.backend.append(&footer.encode())?;
        self.backend.sync()?;

        Ok(PartInfo {
            part_id: self.part_id,
            record_count: self.record_count,
            min_key: self.min_key,
            max_key: self.max_key,
        })
    }
}

fn block_count(len: usize) -> CoreResult<u32> {
    u32::try_from(len).map_err(|_| CoreError::invalid_operation("too many blocks in part"))
}

/// Compresses and writes the open block; `next_record` starts the next one.
fn flush_block(
    backend: &mut dyn StorageBackend,
    compression: CompressionMethod,
    block: &mut OpenBlock,
    handles: &mut Vec<BlockHandle>,
    next_record: u64,
) -> CoreResult<()> {
    if block.record_count == 0 {
        return Ok(());
    }
    let stored = compress(compression, &block.raw);
    let offset = backend.append(&stored)?;
    handles.push(BlockHandle {
        offset,
        stored_len: u32::try_from(stored.len())
            .map_err(|_| CoreError::invalid_operation("block too large"))?,
        first_record: block.first_record,
        record_count: block.record_count,
        crc: crc32fast::hash(&stored),
    });
    block.raw.clear();
    block.first_record = next_record;
    block.record_count = 0;
    Ok(())
}

/// Writes a new disk segment from entries in ascending key order.
///
/// Parts are closed at `maximum_records_per_part` in multi-part mode. The
/// segment header is written last, so a segment that was never completed
/// has no header and is invisible to [`DiskSegment::open`]. Call
/// [`DiskSegmentWriter::abandon`] to remove the parts of an unfinished
/// segment.
pub struct DiskSegmentWriter<S: Schema> {
    segment_id: SegmentId,
    provider: Arc<dyn StoreProvider>,
    part_ids: Arc<IdProvider>,
    options: DiskSegmentOptions,
    events: Arc<EventBus>,
    parts: Vec<PartInfo>,
    current: Option<PartWriter>,
    // Part ids created so far, including the open part.
    created: Vec<u64>,
    last_key: Option<S::Key>,
    record_count: usize,
}

impl<S: Schema> DiskSegmentWriter<S> {
    /// Starts a segment. Part ids are drawn from `part_ids`.
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        segment_id: SegmentId,
        part_ids: Arc<IdProvider>,
        options: DiskSegmentOptions,
        events: Arc<EventBus>,
    ) -> CoreResult<Self> {
        options.validate()?;
        Ok(Self {
            segment_id,
            provider,
            part_ids,
            options,
            events,
            parts: Vec::new(),
            current: None,
            created: Vec::new(),
            last_key: None,
            record_count: 0,
        })
    }

    /// Id of the segment being written.
    #[must_use]
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Records written so far.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Appends an entry. Keys must be strictly ascending.
    pub fn append(&mut self, key: &S::Key, value: &S::Value, op_index: OpIndex) -> CoreResult<()> {
        if let Some(last) = &self.last_key {
            if !compare_keys::<S>(last, key).is_lt() {
                return Err(CoreError::invalid_operation(format!(
                    "disk segment keys must be strictly ascending: {key:?} after {last:?}"
                )));
            }
        }

        if self.current.is_none() {
            let part_id = self.part_ids.next_id();
            let backend = self.provider.create(part_id, category::DISK_PART)?;
            self.created.push(part_id);
            self.current = Some(PartWriter::new(part_id, backend, &self.options));
        }

        let value_bytes = S::ValueSerializer::to_bytes(value);
        let part_full = match self.current.as_mut() {
            Some(part) => {
                part.append(S::KeySerializer::to_bytes(key), &value_bytes, op_index)?;
                self.options.mode == DiskSegmentMode::MultiPart
                    && part.record_count >= self.options.maximum_records_per_part as u64
            }
            None => false,
        };

        self.last_key = Some(key.clone());
        self.record_count += 1;

        if part_full {
            self.close_part()?;
        }
        Ok(())
    }

    fn close_part(&mut self) -> CoreResult<()> {
        if let Some(part) = self.current.take() {
            let info = part.finish()?;
            debug!(
                segment_id = %self.segment_id,
                part_id = info.part_id,
                records = info.record_count,
                "closed disk segment part"
            );
            self.parts.push(info);
        }
        Ok(())
    }

    /// Finishes the last part, writes the header and opens the segment.
    ///
    /// On failure the stores written so far are removed.
    pub fn complete(mut self) -> CoreResult<DiskSegment<S>> {
        if let Err(e) = self.write_header() {
            // Cleanup failures are reported through the event bus.
            let _ = self.abandon();
            return Err(e);
        }

        DiskSegment::open(
            Arc::clone(&self.provider),
            self.segment_id,
            self.options,
            Arc::clone(&self.events),
        )
    }

    fn write_header(&mut self) -> CoreResult<()> {
        self.close_part()?;

        let header = encode_header(&self.parts)?;
        let mut store = self
            .provider
            .create(self.segment_id.as_u64(), category::DISK_HEADER)?;
        store.append(&header)?;
        store.sync()?;
        Ok(())
    }

    /// Removes every store written so far.
    ///
    /// A failed removal fires [`EngineEvent::DiskSegmentCreatorDropFailed`].
    pub fn abandon(mut self) -> CoreResult<()> {
        self.current = None;
        let mut first_error = None;
        for part_id in &self.created {
            if let Err(e) = self.provider.remove(*part_id, category::DISK_PART) {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self
            .provider
            .remove(self.segment_id.as_u64(), category::DISK_HEADER)
        {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => {
                warn!(segment_id = %self.segment_id, error = %e, "failed to remove abandoned disk segment");
                self.events.emit(&EngineEvent::DiskSegmentCreatorDropFailed {
                    segment_id: self.segment_id,
                    error: e.to_string(),
                });
                Err(e.into())
            }
            None => {
                debug!(segment_id = %self.segment_id, parts = self.created.len(), "abandoned disk segment");
                Ok(())
            }
        }
    }
}

impl<S: Schema> fmt::Debug for DiskSegmentWriter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskSegmentWriter")
            .field("segment_id", &self.segment_id)
            .field("parts", &self.parts.len())
            .field("record_count", &self.record_count)
            .finish_non_exhaustive()
    }
}
