// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The facade (§4.4): the crate's single public entry point over the
//! segment manager, the worker pool, and the replayer.

use crate::{
    device::BlockDevice,
    mutation::{Catalog, ColumnFamilyId, FlushExecutor, MutationApplier, MutationCodec, ReplayPosition},
    record::RecordFramer,
    replay::Replayer,
    segment::manager::SegmentManager,
    worker::AppendWorkerPool,
    Config,
};
use std::sync::Arc;

/// Write-ahead commit log over a raw block-addressable device.
///
/// Construct with [`CommitLog::recover`], which scans the bookkeeping
/// region and replays any un-flushed records before the log accepts new
/// appends, mirroring the host database's own startup order (§4.5: "Driven
/// at startup ... before the log accepts any new appends").
pub struct CommitLog {
    segments: SegmentManager,
    workers: AppendWorkerPool,
    bookkeeping_chunk: Arc<dyn crate::device::Chunk>,
    flush_executor: Arc<dyn FlushExecutor>,
    invalid_mutations: u64,
    /// `min(blocks_per_segment, buffer_block_capacity)` (§4.1: "exceeds both
    /// the configured per-segment cap and the per-worker buffer cap"),
    /// checked in [`Self::add`] before any segment state is touched.
    max_record_blocks: u32,
}

impl CommitLog {
    /// Opens the log: scans bookkeeping, replays un-flushed records through
    /// `applier` (filtered by `catalog` and decoded by `codec`), then
    /// returns the ready-to-use log along with the number of mutations
    /// replayed.
    pub fn recover(
        config: &Config,
        device: &dyn BlockDevice,
        codec: &dyn MutationCodec,
        catalog: &dyn Catalog,
        applier: &dyn MutationApplier,
        flush_executor: Arc<dyn FlushExecutor>,
    ) -> crate::Result<(Self, u64)> {
        crate::version::check_and_set(crate::Version::V1)
            .map_err(crate::Error::InvalidVersion)?;

        let bookkeeping_chunk = device.open_chunk("bookkeeping", None)?;

        let (segments, uncommitted) =
            SegmentManager::recover(config, bookkeeping_chunk.clone(), flush_executor.clone())?;

        let replayer = Replayer::new(config, &segments, codec, catalog);
        let replayed = replayer.run(&uncommitted, catalog, &*bookkeeping_chunk, applier)?;
        let invalid_mutations = replayer.invalid_mutations();

        let slots: Vec<u32> = uncommitted.iter().map(|&(slot, _)| slot).collect();
        segments.recycle_after_replay(&slots)?;

        let workers = AppendWorkerPool::new(config, device)?;
        let max_record_blocks = config
            .blocks_per_segment()
            .min(config.buffer_block_capacity());

        let log = Self {
            segments,
            workers,
            bookkeeping_chunk,
            flush_executor,
            invalid_mutations,
            max_record_blocks,
        };

        Ok((log, replayed))
    }

    /// Appends `payload` (already serialized by the caller's mutation codec)
    /// touching the given column families, returning the replay position
    /// the write is now covered by (§4.4 `add`, §9 decision: the precise
    /// allocation's end position).
    ///
    /// If the framed record would exceed the per-segment or per-worker
    /// buffer limit, the oversize condition is logged and
    /// [`ReplayPosition::ZERO`] is returned rather than panicking (§7:
    /// "Oversize mutation ... rejected at add, logged, sentinel returned").
    pub fn add(&self, payload: &[u8], cf_id: ColumnFamilyId) -> crate::Result<ReplayPosition> {
        let block_count = RecordFramer::block_count_for(payload.len());

        if block_count > self.max_record_blocks {
            log::warn!(
                "oversize mutation rejected: {block_count} blocks for cf {cf_id} exceeds cap of {}",
                self.max_record_blocks
            );
            return Ok(ReplayPosition::ZERO);
        }

        let (segment, starting_block) = self.segments.allocate(block_count, cf_id)?;

        let mut worker = self.workers.borrow();
        let physical_start_block =
            self.segments.slot_block_address(segment.slot) + u64::from(starting_block);

        let result = worker.write_record(segment.id, payload, physical_start_block);
        self.workers.give_back(worker);
        result?;

        Ok(segment.replay_position())
    }

    /// Waits for all in-flight appends to complete, then walks active
    /// segments oldest-first, marking `cf_id` clean up to `replay_position`
    /// and recycling any segment that becomes unused and is not the most
    /// recent one, stopping once the segment containing `replay_position`
    /// has been processed (§4.4).
    pub fn discard_completed_segments(
        &self,
        cf_id: ColumnFamilyId,
        replay_position: ReplayPosition,
    ) -> crate::Result<()> {
        self.workers.await_idle();

        let segments = self.segments.active_segments_oldest_first();
        let last_index = segments.len().saturating_sub(1);

        for (index, segment) in segments.iter().enumerate() {
            self.segments.mark_clean(segment, cf_id, replay_position);

            if segment.is_unused() && index != last_index {
                self.segments.recycle_segment(segment)?;
            }

            if segment.id == replay_position.segment_id {
                break;
            }
        }

        Ok(())
    }

    /// Waits for all in-flight appends, then returns the active segment's
    /// current replay position (§4.4 `getContext`).
    pub fn context(&self) -> ReplayPosition {
        self.workers.await_idle();
        self.segments
            .active_segments_oldest_first()
            .into_iter()
            .max_by_key(|s| s.id)
            .map(|s| s.replay_position())
            .unwrap_or(ReplayPosition::ZERO)
    }

    /// Marks every segment clean for the dropped column families, then
    /// recycles every segment that is now unused (§4.2 `forceRecycleAll`).
    pub fn force_recycle_all_segments(&self, dropped_cfs: &[ColumnFamilyId]) -> crate::Result<()> {
        self.segments.force_recycle_all(dropped_cfs)
    }

    /// The number of sub-mutations dropped during the startup replay because
    /// their column family no longer existed in the schema (§7, §10.6).
    #[must_use]
    pub const fn invalid_mutations(&self) -> u64 {
        self.invalid_mutations
    }

    /// The number of segments currently occupying a slot (§10.6).
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.segment_count()
    }

    /// The number of slots currently on the free-list.
    #[must_use]
    pub fn free_segment_count(&self) -> usize {
        self.segments.free_segment_count()
    }

    /// Total bytes written so far across every occupied segment (§10.6).
    #[must_use]
    pub fn disk_space_used(&self) -> u64 {
        self.segments.disk_space_used()
    }

    /// Stops accepting new work: drains the worker pool, closing every
    /// worker's device chunk, then closes the bookkeeping chunk (§4.4).
    pub fn shutdown(&self) -> crate::Result<()> {
        self.workers.shutdown()?;
        self.bookkeeping_chunk.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryDevice;
    use crate::mock::{MockCatalog, MockFlushExecutor, MockMutationApplier, MockMutationCodec};

    fn open_log(config: &Config, device: &InMemoryDevice) -> (CommitLog, u64) {
        let codec = MockMutationCodec;
        let catalog = MockCatalog::default();
        let applier = MockMutationApplier::default();
        let flusher = Arc::new(MockFlushExecutor::default());

        CommitLog::recover(config, device, &codec, &catalog, &applier, flusher).expect("recover")
    }

    #[test]
    fn empty_recover_returns_zero_and_first_add_lands_in_slot_zero() {
        let config = Config::new(vec!["dev0".into()])
            .max_segments(8)
            .blocks_per_segment(4)
            .threads(2)
            .buffer_mib(1);
        let device = InMemoryDevice::new(8 + 8 * 4);
        let (log, replayed) = open_log(&config, &device);
        assert_eq!(replayed, 0);

        let position = log.add(&[0u8; 100], 1).expect("add");
        assert_eq!(position.segment_id, 1);
        assert_eq!(position.block_offset, 1);
    }

    #[test]
    fn two_appends_advance_the_cursor_within_one_segment() {
        let config = Config::new(vec!["dev0".into()])
            .max_segments(8)
            .blocks_per_segment(4)
            .threads(2)
            .buffer_mib(1);
        let device = InMemoryDevice::new(8 + 8 * 4);
        let (log, _) = open_log(&config, &device);

        let first = log.add(&[0u8; 100], 1).expect("add");
        let second = log.add(&[0u8; 100], 1).expect("add");

        assert_eq!(first, ReplayPosition::new(1, 1));
        assert_eq!(second, ReplayPosition::new(1, 2));
    }

    #[test]
    fn discard_recycles_unused_non_last_segment() {
        // Mirrors §8 scenarios S3/S6: K=4, four 4096-byte payloads (2 blocks
        // each) fill slot 0 with two records before slot 1 takes the other two.
        let config = Config::new(vec!["dev0".into()])
            .max_segments(8)
            .blocks_per_segment(4)
            .threads(1)
            .buffer_mib(1);
        let device = InMemoryDevice::new(8 + 8 * 4);
        let (log, _) = open_log(&config, &device);

        let payload = vec![0u8; 4096];
        for _ in 0..4 {
            log.add(&payload, 1).expect("add");
        }

        log.discard_completed_segments(1, ReplayPosition::new(2, 0))
            .expect("discard");

        assert!(log.context().segment_id >= 2);
    }

    #[test]
    fn introspection_accessors_track_writes() {
        let config = Config::new(vec!["dev0".into()])
            .max_segments(8)
            .blocks_per_segment(4)
            .threads(1)
            .buffer_mib(1);
        let device = InMemoryDevice::new(8 + 8 * 4);
        let (log, _) = open_log(&config, &device);

        assert_eq!(log.invalid_mutations(), 0);
        assert_eq!(log.segment_count(), 0);
        assert_eq!(log.disk_space_used(), 0);

        log.add(&[0u8; 100], 1).expect("add");

        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.free_segment_count(), 7);
        assert_eq!(log.disk_space_used(), 4096);
    }

    #[test]
    fn oversize_record_is_rejected_before_touching_segment_state() {
        // blocks_per_segment=2 is far smaller than buffer_mib=1's 256-block
        // capacity; a 4-block payload exceeds the segment cap but not the
        // buffer cap, which is exactly the case the per-segment check at
        // `add` must catch before any segment is activated or mutated.
        let config = Config::new(vec!["dev0".into()])
            .max_segments(8)
            .blocks_per_segment(2)
            .threads(1)
            .buffer_mib(1);
        let device = InMemoryDevice::new(8 + 8 * 2);
        let (log, _) = open_log(&config, &device);

        let oversize_payload = vec![0u8; 4096 * 3];
        let position = log.add(&oversize_payload, 1).expect("add must not error");

        assert_eq!(position, ReplayPosition::ZERO, "rejection must return the sentinel");
        assert_eq!(log.segment_count(), 0, "no segment should be activated");
        assert_eq!(log.free_segment_count(), 8, "free-list must be untouched");

        // A normal append still succeeds afterward.
        let position = log.add(&[0u8; 100], 1).expect("add");
        assert_eq!(position, ReplayPosition::new(1, 1));
    }
}
