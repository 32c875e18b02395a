// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Driven once at startup, after [`crate::segment::manager::SegmentManager`]
//! construction and before the log accepts any new appends (§4.5).

use crate::{
    config::BLOCK_SIZE,
    device::Chunk,
    mutation::{Catalog, ColumnFamilyId, MutationApplier, MutationCodec, ReplayPosition},
    record::{Decoded, RecordFramer},
    segment::manager::{SegmentManager, UncommittedSlots},
    Config,
};
use std::collections::HashSet;

/// Blocks streamed into memory at a time while scanning a slot, bounding
/// the device request size (§4.5, "streaming, rather than a single read").
/// Shrunk under `cfg(test)` so unit and integration tests can exercise a
/// record straddling a chunk boundary without needing a multi-gigabyte segment.
#[cfg(not(test))]
const STREAM_CHUNK_BLOCKS: u32 = 8_000;
#[cfg(test)]
const STREAM_CHUNK_BLOCKS: u32 = 4;

/// Applied-task bound before the replayer drains the applier (§4.5, step 4).
/// Named for the power-of-two the design notes suggest (2^21); our applier
/// calls are synchronous, so this only paces how often `drain` is invoked.
const MAX_OUTSTANDING_APPLIES: u64 = 1 << 21;

pub(crate) struct Replayer<'a> {
    data_offset: u64,
    blocks_per_segment: u32,
    global_floor: ReplayPosition,
    per_cf_floor: std::collections::HashMap<ColumnFamilyId, ReplayPosition>,
    codec: &'a dyn MutationCodec,
    invalid_mutations: std::sync::atomic::AtomicU64,
}

impl<'a> Replayer<'a> {
    pub(crate) fn new(
        config: &Config,
        segments: &SegmentManager,
        codec: &'a dyn MutationCodec,
        catalog: &'a dyn Catalog,
    ) -> Self {
        let cfs = catalog.column_families();

        let per_cf_floor: std::collections::HashMap<_, _> =
            cfs.iter().map(|&cf| (cf, catalog.replay_floor(cf))).collect();

        let global_floor = per_cf_floor
            .values()
            .copied()
            .min()
            .unwrap_or(ReplayPosition::ZERO);

        Self {
            data_offset: segments.data_offset(),
            blocks_per_segment: config.blocks_per_segment(),
            global_floor,
            per_cf_floor,
            codec,
            invalid_mutations: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// The number of sub-mutations dropped because their column family no
    /// longer exists in the schema (§7).
    pub(crate) fn invalid_mutations(&self) -> u64 {
        self.invalid_mutations.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Replays every slot in `uncommitted`, returns the total number of
    /// mutations successfully applied, and, per `blockForWrites` (§4.5),
    /// flushes every column family that received at least one mutation.
    pub(crate) fn run(
        &self,
        uncommitted: &UncommittedSlots,
        catalog: &dyn Catalog,
        chunk: &dyn Chunk,
        applier: &dyn MutationApplier,
    ) -> crate::Result<u64> {
        let mut applied_count = 0u64;
        let mut touched_cfs: HashSet<ColumnFamilyId> = HashSet::new();
        let mut since_drain = 0u64;

        for &(slot, segment_id) in uncommitted {
            let Some(start_offset) = self.slot_start_offset(segment_id) else {
                log::debug!("skipping slot {slot} (segment {segment_id}): below replay floor");
                continue;
            };

            let (applied_here, touched) =
                self.replay_slot(slot, segment_id, start_offset, chunk, catalog, applier)?;

            if applied_here == 0 && start_offset < self.blocks_per_segment {
                log::warn!("slot {slot} (segment {segment_id}) yielded no valid records");
            }

            applied_count += applied_here;
            touched_cfs.extend(touched);
            since_drain += applied_here;

            if since_drain >= MAX_OUTSTANDING_APPLIES {
                applier.drain();
                since_drain = 0;
            }
        }

        applier.drain();

        for cf in touched_cfs {
            applier.flush(cf);
        }

        Ok(applied_count)
    }

    /// `None` means the slot's segment is entirely below the floor and must
    /// be skipped (§4.5, step 1).
    fn slot_start_offset(&self, segment_id: u64) -> Option<u32> {
        use std::cmp::Ordering;
        match segment_id.cmp(&self.global_floor.segment_id) {
            Ordering::Greater => Some(0),
            Ordering::Equal => Some(self.global_floor.block_offset),
            Ordering::Less => None,
        }
    }

    fn replay_slot(
        &self,
        slot: u32,
        segment_id: u64,
        start_offset: u32,
        chunk: &dyn Chunk,
        catalog: &dyn Catalog,
        applier: &dyn MutationApplier,
    ) -> crate::Result<(u64, HashSet<ColumnFamilyId>)> {
        let mut applied_here = 0u64;
        let mut touched = HashSet::new();

        // §4.5 step 2 streams the slot's data blocks "in fixed-size chunks
        // ... until the whole segment is in a contiguous buffer": the
        // chunking only bounds each device request's size, it is not a scan
        // boundary. Records are block-aligned but can still span two
        // STREAM_CHUNK_BLOCKS-sized reads, so the whole remainder of the
        // segment (from start_offset onward) is accumulated into one
        // contiguous buffer before any record is decoded.
        let remaining_blocks = self.blocks_per_segment - start_offset;
        let mut buffer = Vec::with_capacity(remaining_blocks as usize * BLOCK_SIZE);
        let mut read_offset = start_offset;
        while read_offset < self.blocks_per_segment {
            let chunk_blocks = STREAM_CHUNK_BLOCKS.min(self.blocks_per_segment - read_offset);
            let mut chunk_buffer = vec![0u8; chunk_blocks as usize * BLOCK_SIZE];
            let physical_block = self.data_offset
                + u64::from(slot) * u64::from(self.blocks_per_segment)
                + u64::from(read_offset);
            chunk.read_block(physical_block, &mut chunk_buffer)?;
            buffer.extend_from_slice(&chunk_buffer);
            read_offset += chunk_blocks;
        }

        let mut offset = start_offset;
        let mut cursor = 0usize;
        while cursor < buffer.len() {
            match RecordFramer::decode(&buffer[cursor..], segment_id) {
                Decoded::Valid { payload, block_count } => {
                    // Use the record's *end* offset, matching the
                    // convention `add` and the dirty-map watermark use
                    // elsewhere, so `position > floor` is exactly the
                    // negation of `floor.covers(position)`.
                    let position = ReplayPosition::new(segment_id, offset + block_count);
                    let parts = self.codec.decode(&payload);
                    let mut survivors = Vec::new();

                    for (cf, sub_payload) in parts {
                        if !catalog.exists(cf) {
                            self.invalid_mutations
                                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            continue;
                        }

                        let floor = self
                            .per_cf_floor
                            .get(&cf)
                            .copied()
                            .unwrap_or(ReplayPosition::ZERO);

                        if position > floor {
                            touched.insert(cf);
                            survivors.push((cf, sub_payload));
                        }
                    }

                    if !survivors.is_empty() {
                        let filtered = self.codec.encode_filtered(&survivors);
                        applier.apply(&filtered, position);
                        applied_here += 1;
                    }

                    offset += block_count;
                    cursor += block_count as usize * BLOCK_SIZE;
                }
                Decoded::EndOfRecords => break,
                Decoded::Corrupt(reason) => {
                    log::warn!(
                        "corrupt record in slot {slot} segment {segment_id} at offset {offset}: {reason}"
                    );
                    break;
                }
            }
        }

        Ok((applied_here, touched))
    }
}
