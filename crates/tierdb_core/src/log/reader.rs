//! Streaming log reader.
//!
//! Reads records through a bounded buffer so replaying a large log does not
//! load it into memory twice.

use super::record::{LogRecord, RecordHeader, CRC_SIZE, HEADER_SIZE, LOG_VERSION};
use crate::error::{CoreResult, LogIssue, LogIssueKind};
use crate::types::OpIndex;
use tierdb_storage::StorageBackend;

/// Read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Everything a log read produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogReadResult {
    /// Records that decoded cleanly, in log order.
    pub records: Vec<LogRecord>,
    /// Problems found, in log order.
    pub causes: Vec<LogIssue>,
    /// Offset just past the last complete record.
    pub valid_len: u64,
}

impl LogReadResult {
    /// Returns true if no issue was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.causes.is_empty()
    }

    /// Returns true if the only issue is a torn final record.
    #[must_use]
    pub fn is_torn_tail_only(&self) -> bool {
        matches!(
            self.causes.as_slice(),
            [LogIssue {
                kind: LogIssueKind::TruncatedRecord,
                ..
            }]
        )
    }

    /// Highest operation index among the records.
    #[must_use]
    pub fn max_op_index(&self) -> OpIndex {
        self.records
            .iter()
            .map(|r| r.op_index)
            .max()
            .unwrap_or_default()
    }
}

/// Buffered cursor over a store.
pub(super) struct LogReader<'a> {
    backend: &'a dyn StorageBackend,
    total_size: u64,
    /// Offset of the next unread record.
    offset: u64,
    buffer: Vec<u8>,
    /// Store offset of `buffer[0]`.
    buffer_start: u64,
}

impl<'a> LogReader<'a> {
    pub(super) fn new(backend: &'a dyn StorageBackend) -> CoreResult<Self> {
        Ok(Self {
            backend,
            total_size: backend.size()?,
            offset: 0,
            buffer: Vec::new(),
            buffer_start: 0,
        })
    }

    /// Makes `len` bytes at the current offset available in the buffer.
    ///
    /// Returns `false` if the store ends first.
    fn ensure_buffered(&mut self, len: usize) -> CoreResult<bool> {
        if self.offset + len as u64 > self.total_size {
            return Ok(false);
        }

        let buffered_end = self.buffer_start + self.buffer.len() as u64;
        if self.offset >= self.buffer_start && self.offset + len as u64 <= buffered_end {
            return Ok(true);
        }

        // Large records get a buffer of their own size.
        let want = len.max(READ_BUFFER_SIZE) as u64;
        let read_len = want.min(self.total_size - self.offset) as usize;
        self.buffer = self.backend.read_at(self.offset, read_len)?;
        self.buffer_start = self.offset;
        Ok(true)
    }

    fn slice(&self, len: usize) -> &[u8] {
        let at = (self.offset - self.buffer_start) as usize;
        &self.buffer[at..at + len]
    }

    /// Reads every record, collecting issues instead of failing.
    pub(super) fn read_all(mut self) -> CoreResult<LogReadResult> {
        let mut result = LogReadResult::default();

        while self.offset < self.total_size {
            let record_offset = self.offset;
            let issue = |kind| LogIssue {
                offset: record_offset,
                kind,
            };

            if !self.ensure_buffered(HEADER_SIZE)? {
                result.causes.push(issue(LogIssueKind::TruncatedRecord));
                break;
            }

            let header = RecordHeader::parse(self.slice(HEADER_SIZE));
            if !header.magic_ok {
                result.causes.push(issue(LogIssueKind::BadMagic));
                break;
            }
            if header.version > LOG_VERSION {
                result
                    .causes
                    .push(issue(LogIssueKind::UnsupportedVersion(header.version)));
                break;
            }

            let total_len = HEADER_SIZE + header.body_len() + CRC_SIZE;
            if !self.ensure_buffered(total_len)? {
                result.causes.push(issue(LogIssueKind::TruncatedRecord));
                break;
            }

            let bytes = self.slice(total_len);
            let crc_at = total_len - CRC_SIZE;
            let stored = u32::from_le_bytes([
                bytes[crc_at],
                bytes[crc_at + 1],
                bytes[crc_at + 2],
                bytes[crc_at + 3],
            ]);
            let computed = crc32fast::hash(&bytes[..crc_at]);

            if stored == computed {
                let key_end = HEADER_SIZE + header.key_len;
                result.records.push(LogRecord::new(
                    OpIndex::new(header.op_index),
                    bytes[HEADER_SIZE..key_end].to_vec(),
                    bytes[key_end..crc_at].to_vec(),
                ));
            } else {
                result.causes.push(issue(LogIssueKind::ChecksumMismatch {
                    expected: stored,
                    actual: computed,
                }));
            }

            self.offset += total_len as u64;
            result.valid_len = self.offset;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierdb_storage::InMemoryBackend;

    fn backend_with(records: &[LogRecord]) -> InMemoryBackend {
        let mut bytes = Vec::new();
        for record in records {
            record.encode_into(&mut bytes).unwrap();
        }
        InMemoryBackend::with_data(bytes)
    }

    fn record(op: u64, key: &[u8], value: &[u8]) -> LogRecord {
        LogRecord::new(OpIndex::new(op), key.to_vec(), value.to_vec())
    }

    #[test]
    fn reads_empty_store() {
        let backend = InMemoryBackend::new();
        let result = LogReader::new(&backend).unwrap().read_all().unwrap();
        assert!(result.records.is_empty());
        assert!(result.is_clean());
        assert_eq!(result.valid_len, 0);
    }

    #[test]
    fn reads_records_in_order() {
        let records = vec![record(1, b"a", b"1"), record(2, b"b", b"22")];
        let backend = backend_with(&records);

        let result = LogReader::new(&backend).unwrap().read_all().unwrap();
        assert_eq!(result.records, records);
        assert!(result.is_clean());
        assert_eq!(result.valid_len, backend.data().len() as u64);
        assert_eq!(result.max_op_index(), OpIndex::new(2));
    }

    #[test]
    fn checksum_mismatch_skips_record() {
        let records = vec![record(1, b"a", b"1"), record(2, b"b", b"2")];
        let backend = backend_with(&records);
        // Flip a key byte of the first record.
        assert!(backend.corrupt_byte(HEADER_SIZE));

        let result = LogReader::new(&backend).unwrap().read_all().unwrap();
        assert_eq!(result.records, vec![records[1].clone()]);
        assert!(matches!(
            result.causes[0].kind,
            LogIssueKind::ChecksumMismatch { .. }
        ));
        assert!(!result.is_torn_tail_only());
    }

    #[test]
    fn torn_tail_stops_reading() {
        let records = vec![record(1, b"a", b"1"), record(2, b"b", b"2")];
        let mut bytes = backend_with(&records).data();
        let first_len = records[0].encoded_len();
        bytes.truncate(bytes.len() - 3);
        let backend = InMemoryBackend::with_data(bytes);

        let result = LogReader::new(&backend).unwrap().read_all().unwrap();
        assert_eq!(result.records.len(), 1);
        assert!(result.is_torn_tail_only());
        assert_eq!(result.causes[0].offset, first_len as u64);
        assert_eq!(result.valid_len, first_len as u64);
    }

    #[test]
    fn bad_magic_stops_reading() {
        let records = vec![record(1, b"a", b"1"), record(2, b"b", b"2")];
        let backend = backend_with(&records);
        assert!(backend.corrupt_byte(records[0].encoded_len()));

        let result = LogReader::new(&backend).unwrap().read_all().unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.causes[0].kind, LogIssueKind::BadMagic);
    }

    #[test]
    fn records_larger_than_buffer() {
        let big = vec![7u8; READ_BUFFER_SIZE * 2];
        let records = vec![record(1, b"small", b"x"), record(2, b"big", &big)];
        let backend = backend_with(&records);

        let result = LogReader::new(&backend).unwrap().read_all().unwrap();
        assert_eq!(result.records, records);
    }
}
