//! Disk segment options.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Whether a disk segment may be split into parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiskSegmentMode {
    /// One part holds every record.
    SinglePart,
    /// Parts close at `maximum_records_per_part`.
    #[default]
    MultiPart,
}

/// Block compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionMethod {
    /// Blocks are stored as written.
    None,
    /// LZ4 block format with the uncompressed size prepended.
    #[default]
    Lz4,
}

impl CompressionMethod {
    pub(crate) const fn as_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }
}

/// Layout, compression and cache options of disk segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSegmentOptions {
    /// Single or multi part.
    pub mode: DiskSegmentMode,
    /// Uncompressed size at which a block is closed.
    pub compression_block_size: usize,
    /// Block codec.
    pub compression_method: CompressionMethod,
    /// Codec level. Neither codec has levels, so it must be 0; the field
    /// keeps the persisted options stable should a leveled codec be added.
    pub compression_level: i32,
    /// Record count at which a part is closed.
    pub maximum_records_per_part: usize,
    /// Smallest part the writer aims for.
    pub minimum_records_per_part: usize,
    /// Slots in the key cache.
    pub key_cache_size: usize,
    /// Slots in the value cache.
    pub value_cache_size: usize,
    /// Key cache entry lifetime in milliseconds.
    pub key_cache_record_lifetime_ms: u64,
    /// Value cache entry lifetime in milliseconds.
    pub value_cache_record_lifetime_ms: u64,
    /// Every n-th key is sampled into the sparse index; 0 disables it.
    pub sparse_index_step: usize,
}

impl Default for DiskSegmentOptions {
    fn default() -> Self {
        Self {
            mode: DiskSegmentMode::MultiPart,
            compression_block_size: 4 * 1024 * 1024,
            compression_method: CompressionMethod::Lz4,
            compression_level: 0,
            maximum_records_per_part: 3_000_000,
            minimum_records_per_part: 1_500_000,
            key_cache_size: 1024,
            value_cache_size: 1024,
            key_cache_record_lifetime_ms: 10_000,
            value_cache_record_lifetime_ms: 10_000,
            sparse_index_step: 1024,
        }
    }
}

impl DiskSegmentOptions {
    /// Sets the segment mode.
    #[must_use]
    pub const fn mode(mut self, mode: DiskSegmentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the uncompressed block size.
    #[must_use]
    pub const fn compression_block_size(mut self, size: usize) -> Self {
        self.compression_block_size = size;
        self
    }

    /// Sets the block codec.
    #[must_use]
    pub const fn compression_method(mut self, method: CompressionMethod) -> Self {
        self.compression_method = method;
        self
    }

    /// Sets the per-part record limits.
    #[must_use]
    pub const fn records_per_part(mut self, minimum: usize, maximum: usize) -> Self {
        self.minimum_records_per_part = minimum;
        self.maximum_records_per_part = maximum;
        self
    }

    /// Sets both cache sizes.
    #[must_use]
    pub const fn cache_size(mut self, keys: usize, values: usize) -> Self {
        self.key_cache_size = keys;
        self.value_cache_size = values;
        self
    }

    /// Sets both cache lifetimes in milliseconds.
    #[must_use]
    pub const fn cache_record_lifetime_ms(mut self, keys: u64, values: u64) -> Self {
        self.key_cache_record_lifetime_ms = keys;
        self.value_cache_record_lifetime_ms = values;
        self
    }

    /// Sets the sparse index step.
    #[must_use]
    pub const fn sparse_index_step(mut self, step: usize) -> Self {
        self.sparse_index_step = step;
        self
    }

    /// Checks the options for values the writer cannot work with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.compression_block_size == 0 {
            return Err(CoreError::invalid_operation(
                "compression block size must be positive",
            ));
        }
        if self.maximum_records_per_part == 0 {
            return Err(CoreError::invalid_operation(
                "maximum records per part must be positive",
            ));
        }
        if self.compression_level != 0 {
            return Err(CoreError::invalid_operation(format!(
                "compression level {} is not supported by {:?}",
                self.compression_level, self.compression_method
            )));
        }
        if self.minimum_records_per_part > self.maximum_records_per_part {
            return Err(CoreError::invalid_operation(format!(
                "minimum records per part ({}) exceeds maximum ({})",
                self.minimum_records_per_part, self.maximum_records_per_part
            )));
        }
        Ok(())
    }
}
