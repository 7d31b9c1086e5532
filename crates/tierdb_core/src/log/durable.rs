//! Durable log handle.

use super::reader::{LogReadResult, LogReader};
use super::record::LogRecord;
use crate::config::LogOptions;
use crate::error::CoreResult;
use crate::types::SegmentId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tierdb_storage::{StorageBackend, StoreProvider};

/// An append-only record log stored at `(segment id, category)`.
///
/// Appends are serialized by an internal lock and are synchronous: when
/// `sync_on_write` is set the data is flushed before `append` returns.
pub struct DurableLog {
    segment_id: SegmentId,
    category: &'static str,
    provider: Arc<dyn StoreProvider>,
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl DurableLog {
    /// Opens the log of a segment, creating it if missing.
    pub fn open(
        provider: Arc<dyn StoreProvider>,
        segment_id: SegmentId,
        category: &'static str,
        options: LogOptions,
    ) -> CoreResult<Self> {
        let backend = provider.open_or_create(segment_id.as_u64(), category)?;
        Ok(Self {
            segment_id,
            category,
            provider,
            backend: Mutex::new(backend),
            sync_on_write: options.sync_on_write,
        })
    }

    /// Returns the owning segment id.
    #[must_use]
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Appends a record and returns its offset.
    pub fn append(&self, record: &LogRecord) -> CoreResult<u64> {
        let data = record.encode()?;

        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        if self.sync_on_write {
            backend.flush()?;
        }
        Ok(offset)
    }

    /// Reads every record, collecting issues instead of failing.
    ///
    /// # Errors
    ///
    /// Only store I/O errors are returned; format problems are reported in
    /// [`LogReadResult::causes`].
    pub fn read_all(&self) -> CoreResult<LogReadResult> {
        let backend = self.backend.lock();
        LogReader::new(backend.as_ref())?.read_all()
    }

    /// Rewrites the log to contain exactly `records`.
    ///
    /// The rewrite goes through [`StoreProvider::replace`]: either the new
    /// records are durable and in place, or the log still holds its previous
    /// records and this returns an error.
    pub fn replace(&self, records: &[LogRecord]) -> CoreResult<()> {
        let mut data = Vec::with_capacity(records.iter().map(LogRecord::encoded_len).sum());
        for record in records {
            record.encode_into(&mut data)?;
        }

        let mut backend = self.backend.lock();
        *backend = self
            .provider
            .replace(self.segment_id.as_u64(), self.category, &data)?;
        Ok(())
    }

    /// Cuts the log back to `len` bytes.
    pub fn truncate(&self, len: u64) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.truncate(len)?;
        backend.sync()?;
        Ok(())
    }

    /// Returns the log size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Makes every appended record durable.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.lock().sync()?;
        Ok(())
    }

    /// Removes the log's store.
    pub fn drop_log(&self) -> CoreResult<()> {
        self.provider
            .remove(self.segment_id.as_u64(), self.category)?;
        Ok(())
    }
}

impl fmt::Debug for DurableLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableLog")
            .field("segment_id", &self.segment_id)
            .field("category", &self.category)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}
