//! Error types for TierDB core.

use crate::types::SegmentId;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in engine operations.
///
/// A key missing from every tier is not an error (`Ok(None)`), and neither
/// is a merge skipped because another one is running.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Store error.
    #[error("storage error: {0}")]
    Storage(#[from] tierdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A segment log could not be replayed. The log has been removed and
    /// the segment was not constructed.
    #[error("log of segment {segment_id} is corrupted: {}", join_issues(.causes))]
    LogCorruption {
        /// Segment owning the log.
        segment_id: SegmentId,
        /// Every problem found while reading the log.
        causes: Vec<LogIssue>,
    },

    /// A disk segment is corrupted or invalid.
    #[error("segment corruption: {message}")]
    SegmentCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Invalid on-disk format or metadata that does not match the schema.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid.
        message: String,
    },

    /// A key or value could not be (de)serialized.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// Metadata could not be encoded or decoded.
    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The engine is in read-only mode.
    #[error("engine is read-only")]
    ReadOnly,
}

impl CoreError {
    /// Creates a segment corruption error.
    pub fn segment_corruption(message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true for [`CoreError::LogCorruption`].
    #[must_use]
    pub fn is_log_corruption(&self) -> bool {
        matches!(self, Self::LogCorruption { .. })
    }
}

/// One problem found while reading a durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogIssue {
    /// Offset of the record that could not be read.
    pub offset: u64,
    /// What was wrong with it.
    pub kind: LogIssueKind,
}

/// The kind of a [`LogIssue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogIssueKind {
    /// The record header does not start with the log magic.
    BadMagic,
    /// The record was written by a newer format version.
    UnsupportedVersion(u16),
    /// Stored and computed CRC differ.
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },
    /// The log ends in the middle of a record.
    TruncatedRecord,
    /// The key or value bytes could not be deserialized.
    Undecodable(String),
}

impl fmt::Display for LogIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LogIssueKind::BadMagic => write!(f, "invalid magic at offset {}", self.offset),
            LogIssueKind::UnsupportedVersion(v) => {
                write!(f, "unsupported version {v} at offset {}", self.offset)
            }
            LogIssueKind::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch at offset {}: expected {expected:08x}, got {actual:08x}",
                self.offset
            ),
            LogIssueKind::TruncatedRecord => {
                write!(f, "truncated record at offset {}", self.offset)
            }
            LogIssueKind::Undecodable(msg) => {
                write!(f, "undecodable record at offset {}: {msg}", self.offset)
            }
        }
    }
}

fn join_issues(issues: &[LogIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
