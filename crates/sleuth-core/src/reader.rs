//! Block record framing for archive regions.
//!
//! A region is a concatenation of `magic (4, LE) || size (4, LE) || block`
//! records, possibly followed by zero padding left by file pre-allocation.
//! [`read_block`] decodes one record and advances the cursor past it.

use bitcoin::Block;
use bitcoin::consensus::deserialize;

use crate::constants::{BLOCK_HEADER_SIZE, RECORD_PREFIX_SIZE};
use crate::error::ReadError;

/// Mutable position over a region's bytes.
#[derive(Debug, Clone)]
pub struct RegionCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RegionCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Cursor starting at `pos`, clamped to the region length.
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self {
            data,
            pos: pos.min(data.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u32_le(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }
}

/// Decode the next block record from `cursor`, expecting `magic`.
///
/// On success the cursor sits just past the record and the returned offset is
/// where the record's magic started. Leading zero bytes are skipped. When only
/// zeros remain (at least one full magic worth) the cursor is left at the start
/// of the padding and [`ReadError::IncompleteRegion`] is returned, so a later
/// call can pick up bytes appended in place.
pub fn read_block(cursor: &mut RegionCursor<'_>, magic: u32) -> Result<(usize, Block), ReadError> {
    if cursor.is_exhausted() {
        return Err(ReadError::EndOfRegion);
    }

    let padding_start = cursor.pos;
    let skipped = cursor.data[cursor.pos..]
        .iter()
        .take_while(|b| **b == 0)
        .count();
    cursor.pos += skipped;

    if cursor.is_exhausted() {
        if skipped >= 4 {
            cursor.pos = padding_start;
            return Err(ReadError::IncompleteRegion {
                offset: padding_start,
            });
        }
        return Err(ReadError::EndOfRegion);
    }

    let offset = cursor.pos;

    if cursor.remaining() < RECORD_PREFIX_SIZE {
        return Err(ReadError::Decode {
            offset,
            reason: format!("truncated record header: {} bytes left", cursor.remaining()),
        });
    }

    let found = cursor.read_u32_le().unwrap_or_default();
    if found != magic {
        return Err(ReadError::Framing {
            offset,
            reason: format!("magic mismatch: expected {magic:#010x}, found {found:#010x}"),
        });
    }

    let size = cursor.read_u32_le().unwrap_or_default() as usize;
    if size < BLOCK_HEADER_SIZE {
        return Err(ReadError::Framing {
            offset,
            reason: format!("record size {size} below header size {BLOCK_HEADER_SIZE}"),
        });
    }

    let remaining = cursor.remaining();
    let payload = cursor.take(size).ok_or_else(|| ReadError::Decode {
        offset,
        reason: format!("record size {size} exceeds {remaining} remaining bytes"),
    })?;

    let block: Block = deserialize(payload).map_err(|e| ReadError::Decode {
        offset,
        reason: e.to_string(),
    })?;

    Ok((offset, block))
}

/// Whether the record starting at `offset` runs past the end of `data`.
pub fn record_is_truncated(data: &[u8], offset: usize) -> bool {
    let Some(rest) = data.get(offset..) else {
        return true;
    };
    if rest.len() < RECORD_PREFIX_SIZE {
        return true;
    }
    let size = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
    rest.len() - RECORD_PREFIX_SIZE < size
}

/// Frame a block as an archive record. Inverse of [`read_block`].
pub fn encode_record(block: &Block, magic: u32) -> Vec<u8> {
    let payload = bitcoin::consensus::serialize(block);
    let mut out = Vec::with_capacity(RECORD_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&magic.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out
}
