//! Engine configuration.

use crate::disk::DiskSegmentOptions;
use serde::{Deserialize, Serialize};

/// What to do with a log that ends in the middle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TailPolicy {
    /// Treat the torn record as corruption: the log is removed and the
    /// segment is not constructed.
    #[default]
    Fail,
    /// Cut the log back to the last complete record and continue.
    Truncate,
}

/// Durable log options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Whether every append is flushed before the write returns.
    pub sync_on_write: bool,

    /// Handling of a torn final record on replay.
    pub tail_policy: TailPolicy,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            tail_policy: TailPolicy::Fail,
        }
    }
}

impl LogOptions {
    /// Sets whether every append is flushed.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the torn-tail policy.
    #[must_use]
    pub const fn tail_policy(mut self, policy: TailPolicy) -> Self {
        self.tail_policy = policy;
        self
    }
}

/// Configuration for opening an engine.
///
/// The item-count thresholds and the log and disk segment options are
/// persisted in the metadata; reopening an existing engine keeps the
/// options supplied at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Record count at which the mutable segment is sealed automatically.
    pub mutable_segment_max_item_count: usize,

    /// Record count at which a merged disk segment moves to the bottom tier.
    pub disk_segment_max_item_count: usize,

    /// Durable log options.
    pub log: LogOptions,

    /// Disk segment layout, compression and cache options.
    pub disk_segment: DiskSegmentOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            mutable_segment_max_item_count: 1_000_000,
            disk_segment_max_item_count: 20_000_000,
            log: LogOptions::default(),
            disk_segment: DiskSegmentOptions::default(),
        }
    }
}

impl EngineOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the mutable segment seal threshold.
    #[must_use]
    pub const fn mutable_segment_max_item_count(mut self, count: usize) -> Self {
        self.mutable_segment_max_item_count = count;
        self
    }

    /// Sets the record count at which a disk segment moves to the bottom tier.
    #[must_use]
    pub const fn disk_segment_max_item_count(mut self, count: usize) -> Self {
        self.disk_segment_max_item_count = count;
        self
    }

    /// Sets the log options.
    #[must_use]
    pub const fn log(mut self, log: LogOptions) -> Self {
        self.log = log;
        self
    }

    /// Sets the disk segment options.
    #[must_use]
    pub const fn disk_segment(mut self, options: DiskSegmentOptions) -> Self {
        self.disk_segment = options;
        self
    }
}
