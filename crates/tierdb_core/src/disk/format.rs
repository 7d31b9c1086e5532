//! On-disk layout of disk segments.
//!
//! ## Part Store
//!
//! ```text
//! | key blocks | value blocks | key block index | value block index | footer (39) |
//! ```
//!
//! A block is a run of entries `| len (4) | payload |`, compressed as a
//! whole. Key payloads are serialized keys; value payloads are
//! `| op_index (8) | serialized value |`.
//!
//! Block index entry:
//!
//! ```text
//! | offset (8) | stored_len (4) | first_record (8) | record_count (4) | crc32 (4) |
//! ```
//!
//! Footer:
//!
//! ```text
//! | key_index_offset (8) | key_blocks (4) | value_index_offset (8) | value_blocks (4) |
//! | record_count (8) | compression (1) | magic "TPRT" (4) | version (2) |
//! ```
//!
//! ## Header Store
//!
//! ```text
//! | magic "TDSK" (4) | version (2) | part_count (4) | parts... | crc32 (4) |
//! part: | part_id (8) | record_count (8) | min_len (4) | min_key | max_len (4) | max_key |
//! ```
//!
//! All integers are little-endian.

use super::options::CompressionMethod;
use crate::error::{CoreError, CoreResult};
use crate::types::OpIndex;

pub(crate) const PART_MAGIC: [u8; 4] = *b"TPRT";
pub(crate) const HEADER_MAGIC: [u8; 4] = *b"TDSK";
pub(crate) const FORMAT_VERSION: u16 = 1;

pub(crate) const BLOCK_HANDLE_SIZE: usize = 28;
pub(crate) const FOOTER_SIZE: usize = 39;

/// Little-endian cursor over a byte slice.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CoreError::segment_corruption(format!(
                "unexpected end of data: need {len} bytes at {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

fn len_u32(len: usize, what: &str) -> CoreResult<u32> {
    u32::try_from(len).map_err(|_| CoreError::invalid_operation(format!("{what} too large")))
}

/// Appends one length-prefixed entry to a block.
pub(crate) fn push_entry(block: &mut Vec<u8>, payload: &[u8]) -> CoreResult<()> {
    block.extend_from_slice(&len_u32(payload.len(), "block entry")?.to_le_bytes());
    block.extend_from_slice(payload);
    Ok(())
}

/// Splits a decoded block into entry payloads.
pub(crate) fn split_entries(raw: &[u8], expected: usize) -> CoreResult<Vec<Vec<u8>>> {
    let mut cursor = Cursor::new(raw);
    let mut entries = Vec::with_capacity(expected);
    while cursor.remaining() > 0 {
        let len = cursor.u32()? as usize;
        entries.push(cursor.take(len)?.to_vec());
    }
    if entries.len() != expected {
        return Err(CoreError::segment_corruption(format!(
            "block holds {} entries, index says {expected}",
            entries.len()
        )));
    }
    Ok(entries)
}

/// Builds a value entry payload.
pub(crate) fn value_payload(op_index: OpIndex, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&op_index.as_u64().to_le_bytes());
    out.extend_from_slice(value);
    out
}

/// Splits a value entry payload into operation index and value bytes.
pub(crate) fn split_value_payload(payload: &[u8]) -> CoreResult<(OpIndex, &[u8])> {
    let mut cursor = Cursor::new(payload);
    let op = cursor.u64()?;
    Ok((OpIndex::new(op), &payload[8..]))
}

pub(crate) fn compress(method: CompressionMethod, raw: &[u8]) -> Vec<u8> {
    match method {
        CompressionMethod::None => raw.to_vec(),
        CompressionMethod::Lz4 => lz4_flex::compress_prepend_size(raw),
    }
}

pub(crate) fn decompress(method: CompressionMethod, stored: &[u8]) -> CoreResult<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(stored.to_vec()),
        CompressionMethod::Lz4 => lz4_flex::decompress_size_prepended(stored)
            .map_err(|e| CoreError::segment_corruption(format!("lz4 decompression failed: {e}"))),
    }
}

/// Location of one block inside a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    pub offset: u64,
    pub stored_len: u32,
    /// Part-local index of the block's first record.
    pub first_record: u64,
    pub record_count: u32,
    pub crc: u32,
}

impl BlockHandle {
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.stored_len.to_le_bytes());
        out.extend_from_slice(&self.first_record.to_le_bytes());
        out.extend_from_slice(&self.record_count.to_le_bytes());
        out.extend_from_slice(&self.crc.to_le_bytes());
    }

    pub(crate) fn decode_all(data: &[u8], count: usize) -> CoreResult<Vec<Self>> {
        let mut cursor = Cursor::new(data);
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            handles.push(Self {
                offset: cursor.u64()?,
                stored_len: cursor.u32()?,
                first_record: cursor.u64()?,
                record_count: cursor.u32()?,
                crc: cursor.u32()?,
            });
        }
        Ok(handles)
    }

    /// Returns true if the block holds part-local record `index`.
    pub(crate) fn contains(&self, index: u64) -> bool {
        index >= self.first_record && index < self.first_record + u64::from(self.record_count)
    }
}

/// Trailer of a part store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PartFooter {
    pub key_index_offset: u64,
    pub key_blocks: u32,
    pub value_index_offset: u64,
    pub value_blocks: u32,
    pub record_count: u64,
    pub compression: CompressionMethod,
}

impl PartFooter {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FOOTER_SIZE);
        out.extend_from_slice(&self.key_index_offset.to_le_bytes());
        out.extend_from_slice(&self.key_blocks.to_le_bytes());
        out.extend_from_slice(&self.value_index_offset.to_le_bytes());
        out.extend_from_slice(&self.value_blocks.to_le_bytes());
        out.extend_from_slice(&self.record_count.to_le_bytes());
        out.push(self.compression.as_byte());
        out.extend_from_slice(&PART_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out
    }

    pub(crate) fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut cursor = Cursor::new(data);
        let key_index_offset = cursor.u64()?;
        let key_blocks = cursor.u32()?;
        let value_index_offset = cursor.u64()?;
        let value_blocks = cursor.u32()?;
        let record_count = cursor.u64()?;
        let compression_byte = cursor.u8()?;

        if cursor.take(4)? != PART_MAGIC {
            return Err(CoreError::invalid_format("invalid part magic"));
        }
        let version = cursor.u16()?;
        if version > FORMAT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported part version {version}"
            )));
        }
        let compression = CompressionMethod::from_byte(compression_byte).ok_or_else(|| {
            CoreError::invalid_format(format!("unknown compression method {compression_byte}"))
        })?;

        Ok(Self {
            key_index_offset,
            key_blocks,
            value_index_offset,
            value_blocks,
            record_count,
            compression,
        })
    }
}

/// Summary of one part, listed in the segment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartInfo {
    pub part_id: u64,
    pub record_count: u64,
    /// Serialized smallest key.
    pub min_key: Vec<u8>,
    /// Serialized largest key.
    pub max_key: Vec<u8>,
}

/// Encodes the part list of a segment.
pub(crate) fn encode_header(parts: &[PartInfo]) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&HEADER_MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&len_u32(parts.len(), "part list")?.to_le_bytes());
    for part in parts {
        out.extend_from_slice(&part.part_id.to_le_bytes());
        out.extend_from_slice(&part.record_count.to_le_bytes());
        out.extend_from_slice(&len_u32(part.min_key.len(), "key")?.to_le_bytes());
        out.extend_from_slice(&part.min_key);
        out.extend_from_slice(&len_u32(part.max_key.len(), "key")?.to_le_bytes());
        out.extend_from_slice(&part.max_key);
    }
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Decodes and verifies a segment header.
pub(crate) fn decode_header(data: &[u8]) -> CoreResult<Vec<PartInfo>> {
    if data.len() < 14 {
        return Err(CoreError::segment_corruption("segment header too short"));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    let mut cursor = Cursor::new(body);
    if cursor.take(4)? != HEADER_MAGIC {
        return Err(CoreError::invalid_format("invalid segment header magic"));
    }
    let version = cursor.u16()?;
    if version > FORMAT_VERSION {
        return Err(CoreError::invalid_format(format!(
            "unsupported segment header version {version}"
        )));
    }

    let count = cursor.u32()? as usize;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let part_id = cursor.u64()?;
        let record_count = cursor.u64()?;
        let min_len = cursor.u32()? as usize;
        let min_key = cursor.take(min_len)?.to_vec();
        let max_len = cursor.u32()? as usize;
        let max_key = cursor.take(max_len)?.to_vec();
        parts.push(PartInfo {
            part_id,
            record_count,
            min_key,
            max_key,
        });
    }
    Ok(parts)
}
