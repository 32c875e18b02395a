// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Stateless encoder/decoder for a single on-flash record (§4.1).
//!
//! ```text
//! offset 0   : u64  segment_id          (must equal the owning segment's id)
//! offset 8   : u32  serialized_size     (= 28 + payload_size; >= 38)
//! offset 12  : u64  header_checksum     (CRC32 over offsets 0..12, extended to 64)
//! offset 20  : ...  payload             (opaque mutation bytes)
//! offset 20+payload : u64 payload_checksum (CRC32 over offsets 20..20+payload)
//! remaining block tail : undefined (padding)
//! ```
//!
//! All fixed-width fields are big-endian (§6). A record never crosses
//! segment boundaries.

use crate::{config::BLOCK_SIZE, id::SegmentId};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

/// Size in bytes of the four fixed header/trailer fields.
pub const FIXED_OVERHEAD: usize = 8 + 4 + 8 + 8;

/// The minimum legal value of `serialized_size`. Smaller than this, a frame
/// cannot hold a real mutation payload and is treated as corruption rather
/// than an unusually small record (§4.1).
pub const MIN_SERIALIZED_SIZE: u32 = 38;

/// Outcome of [`RecordFramer::decode`].
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed record was found.
    Valid {
        /// The record's payload bytes.
        payload: Vec<u8>,
        /// Blocks the record occupies, including padding.
        block_count: u32,
    },
    /// The header's `segment_id` did not match what was expected: a clean,
    /// never-written tail, not corruption.
    EndOfRecords,
    /// A checksum or size field failed validation.
    Corrupt(&'static str),
}

/// Stateless encoder/decoder for on-flash records.
pub struct RecordFramer;

impl RecordFramer {
    /// Blocks a record of `payload_len` bytes would occupy.
    #[must_use]
    pub fn block_count_for(payload_len: usize) -> u32 {
        let total = FIXED_OVERHEAD + payload_len;
        u32::try_from(total.div_ceil(BLOCK_SIZE)).expect("record size fits in u32 blocks")
    }

    /// Encodes `payload` as a framed, block-padded record for `segment_id`
    /// into `out` (which is cleared first), returning the block count.
    ///
    /// Fails with [`crate::Error::RecordTooLarge`] if the record would
    /// exceed `max_blocks` (the caller passes in
    /// `min(segment capacity, worker buffer capacity)`, per §4.1).
    pub fn encode(
        segment_id: SegmentId,
        payload: &[u8],
        max_blocks: u32,
        out: &mut Vec<u8>,
    ) -> crate::Result<u32> {
        let block_count = Self::block_count_for(payload.len());

        if block_count > max_blocks {
            return Err(crate::Error::RecordTooLarge {
                block_count,
                segment_capacity: max_blocks,
                buffer_capacity: max_blocks,
            });
        }

        let serialized_size = u32::try_from(FIXED_OVERHEAD + payload.len())
            .expect("checked against max_blocks above");

        out.clear();
        out.reserve(block_count as usize * BLOCK_SIZE);

        out.write_u64::<BigEndian>(segment_id)?;
        out.write_u32::<BigEndian>(serialized_size)?;

        let header_checksum = u64::from(crc32fast::hash(&header_bytes(segment_id, serialized_size)));
        out.write_u64::<BigEndian>(header_checksum)?;

        out.write_all(payload)?;

        let payload_checksum = u64::from(crc32fast::hash(payload));
        out.write_u64::<BigEndian>(payload_checksum)?;

        out.resize(block_count as usize * BLOCK_SIZE, 0);

        Ok(block_count)
    }

    /// Decodes one record from the front of `block_bytes`, which must hold
    /// at least one full block.
    #[must_use]
    pub fn decode(block_bytes: &[u8], expected_segment_id: SegmentId) -> Decoded {
        if block_bytes.len() < FIXED_OVERHEAD {
            return Decoded::Corrupt("short-buffer");
        }

        let mut cursor = block_bytes;
        let segment_id = cursor.read_u64::<BigEndian>().expect("length checked above");
        let serialized_size = cursor.read_u32::<BigEndian>().expect("length checked above");
        let header_checksum = cursor.read_u64::<BigEndian>().expect("length checked above");

        if segment_id != expected_segment_id {
            return Decoded::EndOfRecords;
        }

        if serialized_size < MIN_SERIALIZED_SIZE {
            return Decoded::Corrupt("size");
        }

        let expected_header_checksum =
            u64::from(crc32fast::hash(&header_bytes(segment_id, serialized_size)));
        if header_checksum != expected_header_checksum {
            return Decoded::Corrupt("header-crc");
        }

        let payload_len = serialized_size as usize - FIXED_OVERHEAD;
        let payload_end = 20 + payload_len;

        if block_bytes.len() < payload_end + 8 {
            return Decoded::Corrupt("short-buffer");
        }

        let payload = &block_bytes[20..payload_end];

        let mut checksum_bytes = &block_bytes[payload_end..payload_end + 8];
        let payload_checksum = checksum_bytes
            .read_u64::<BigEndian>()
            .expect("length checked above");

        if payload_checksum != u64::from(crc32fast::hash(payload)) {
            return Decoded::Corrupt("payload-crc");
        }

        let block_count = Self::block_count_for(payload_len);

        Decoded::Valid {
            payload: payload.to_vec(),
            block_count,
        }
    }
}

fn header_bytes(segment_id: SegmentId, serialized_size: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..8].copy_from_slice(&segment_id.to_be_bytes());
    buf[8..12].copy_from_slice(&serialized_size.to_be_bytes());
    buf
}
