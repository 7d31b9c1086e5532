//! Log record framing.

use crate::error::{CoreError, CoreResult};
use crate::types::OpIndex;

/// Magic bytes identifying a log record.
pub(crate) const LOG_MAGIC: [u8; 4] = *b"TLOG";

/// Current log format version.
pub(crate) const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + op index (8) + key length (4) + value length (4)
pub(super) const HEADER_SIZE: usize = 22;

pub(super) const CRC_SIZE: usize = 4;

/// One serialized write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Operation index of the write.
    pub op_index: OpIndex,
    /// Serialized key.
    pub key: Vec<u8>,
    /// Serialized value. Deletions carry a tombstoned value.
    pub value: Vec<u8>,
}

impl LogRecord {
    /// Creates a record.
    pub fn new(op_index: OpIndex, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            op_index,
            key,
            value,
        }
    }

    /// Size of the framed record in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.value.len() + CRC_SIZE
    }

    /// Appends the framed record to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or value exceeds 4 GiB.
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) -> CoreResult<()> {
        let key_len = u32::try_from(self.key.len())
            .map_err(|_| CoreError::invalid_operation("log record key too large"))?;
        let value_len = u32::try_from(self.value.len())
            .map_err(|_| CoreError::invalid_operation("log record value too large"))?;

        let start = out.len();
        out.reserve(self.encoded_len());
        out.extend_from_slice(&LOG_MAGIC);
        out.extend_from_slice(&LOG_VERSION.to_le_bytes());
        out.extend_from_slice(&self.op_index.as_u64().to_le_bytes());
        out.extend_from_slice(&key_len.to_le_bytes());
        out.extend_from_slice(&value_len.to_le_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);

        let crc = crc32fast::hash(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Encodes the framed record into a fresh buffer.
    pub(crate) fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }
}

/// Fixed-size header fields of a record.
pub(super) struct RecordHeader {
    pub magic_ok: bool,
    pub version: u16,
    pub op_index: u64,
    pub key_len: usize,
    pub value_len: usize,
}

impl RecordHeader {
    pub(super) fn parse(bytes: &[u8]) -> Self {
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]) as usize
        };
        let mut op = [0u8; 8];
        op.copy_from_slice(&bytes[6..14]);
        Self {
            magic_ok: bytes[0..4] == LOG_MAGIC,
            version: u16::from_le_bytes([bytes[4], bytes[5]]),
            op_index: u64::from_le_bytes(op),
            key_len: u32_at(14),
            value_len: u32_at(18),
        }
    }

    pub(super) fn body_len(&self) -> usize {
        self.key_len + self.value_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_layout() {
        let record = LogRecord::new(OpIndex::new(3), b"ab".to_vec(), b"xyz".to_vec());
        let bytes = record.encode().unwrap();

        assert_eq!(bytes.len(), record.encoded_len());
        assert_eq!(&bytes[0..4], b"TLOG");

        let header = RecordHeader::parse(&bytes[..HEADER_SIZE]);
        assert!(header.magic_ok);
        assert_eq!(header.version, LOG_VERSION);
        assert_eq!(header.op_index, 3);
        assert_eq!(header.key_len, 2);
        assert_eq!(header.value_len, 3);

        let crc_at = bytes.len() - CRC_SIZE;
        let stored = u32::from_le_bytes(bytes[crc_at..].try_into().unwrap());
        assert_eq!(stored, crc32fast::hash(&bytes[..crc_at]));
    }
}
