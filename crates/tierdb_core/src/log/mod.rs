//! Durable, append-only segment logs.
//!
//! Every mutable segment owns one log. A write is appended to the log
//! before it becomes visible in memory, so replaying the log rebuilds the
//! segment after a restart.
//!
//! ## Record Format
//!
//! ```text
//! | magic "TLOG" (4) | version (2) | op_index (8) | key_len (4) | value_len (4) | key | value | crc32 (4) |
//! ```
//!
//! All integers are little-endian; the CRC covers every byte before it.
//!
//! ## Replay
//!
//! Reading a log never fails halfway through: it returns every record it
//! could decode plus a list of [`crate::LogIssue`]s.
//!
//! - **CRC mismatch**: recorded, the record is skipped, reading continues
//! - **Invalid magic / unsupported version**: recorded, reading stops
//! - **Truncated record**: recorded, reading stops; `valid_len` marks the
//!   start of the torn record so the caller may cut the log back to it
//!
//! Whether issues are fatal is decided by the owner of the log.

mod durable;
mod reader;
mod record;

pub use durable::DurableLog;
pub use reader::LogReadResult;
pub use record::LogRecord;
