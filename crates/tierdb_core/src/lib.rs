//! # TierDB Core
//!
//! An embeddable, ordered key-value engine built on a log-structured merge
//! architecture.
//!
//! Writes land in a mutable in-memory segment backed by a durable log.
//! Sealed segments queue up as read-only segments until the merge engine
//! folds them into an immutable, sorted disk segment; large disk segments
//! move to the bottom tier, where a second merge keeps lookup fan-out
//! bounded. Reads fan out newest-first: mutable, read-only, disk, bottom.
//!
//! ```rust
//! use std::sync::Arc;
//! use tierdb_core::{BytesSchema, Deletable, Engine, EngineOptions, MergeOutcome};
//! use tierdb_storage::InMemoryStoreProvider;
//!
//! let provider = Arc::new(InMemoryStoreProvider::new());
//! let engine = Engine::<BytesSchema>::open(EngineOptions::default(), provider).unwrap();
//!
//! engine.upsert(b"k".to_vec(), Deletable::new(b"v".to_vec())).unwrap();
//! engine.seal_mutable_segment().unwrap();
//! assert_eq!(engine.merge_read_only_segments().unwrap(), MergeOutcome::Success);
//! assert_eq!(
//!     engine.get(&b"k".to_vec()).unwrap(),
//!     Some(Deletable::new(b"v".to_vec()))
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod disk;
mod engine;
mod error;
mod events;
mod log;
mod maintainer;
mod map;
mod merge;
mod meta;
mod schema;
mod segment;
mod serializer;
mod types;

pub use config::{EngineOptions, LogOptions, TailPolicy};
pub use disk::{
    CircularCache, CompressionMethod, DiskSegment, DiskSegmentIter, DiskSegmentMode,
    DiskSegmentOptions, DiskSegmentWriter,
};
pub use engine::{Engine, EngineIter, MergeOutcome};
pub use error::{CoreError, CoreResult, LogIssue, LogIssueKind};
pub use events::{EngineEvent, EventBus, EventKind, SubscriptionId};
pub use log::{DurableLog, LogReadResult, LogRecord};
pub use maintainer::{Maintainer, MaintainerOptions};
pub use map::{RecoverableMap, TombstonePolicy};
pub use merge::{MergeIterator, SegmentCursor, SegmentEntry};
pub use meta::{MetaLog, TreeMeta};
pub use schema::{
    BytesSchema, Deletable, DeletableMarker, DeletionMarker, KeyComparator, OrdComparator,
    Schema, SchemaTypes,
};
pub use segment::{MutableSegment, SegmentQueue, SegmentTier, UpsertOutcome};
pub use serializer::{
    BytesSerializer, DeletableSerializer, I64Serializer, Serializer, StringSerializer,
    U64Serializer,
};
pub use types::{IdProvider, OpIndex, SegmentId};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Store categories used with a [`tierdb_storage::StoreProvider`].
pub mod category {
    /// Durable logs of mutable and read-only segments.
    pub const SEGMENT_LOG: &str = "seg";
    /// Disk segment headers (part lists).
    pub const DISK_HEADER: &str = "disk";
    /// Disk segment parts.
    pub const DISK_PART: &str = "part";
    /// The metadata log.
    pub const META: &str = "meta";
}
