//! Immutable, sorted, persisted segments.
//!
//! A disk segment is a header store listing its parts plus one store per
//! part. Parts hold compressed key and value blocks, a block index and a
//! footer; the `format` module documents the byte layout.

mod cache;
mod format;
mod options;
mod segment;
mod writer;

pub use cache::CircularCache;
pub use options::{CompressionMethod, DiskSegmentMode, DiskSegmentOptions};
pub use segment::{DiskSegment, DiskSegmentIter};
pub use writer::DiskSegmentWriter;
