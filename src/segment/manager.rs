// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Owns the segment ring, the free-list, the active pointer, and the
//! bookkeeping chunk (§4.2). Single instance per log.

use super::Segment;
use crate::{
    config::BLOCK_SIZE,
    device::Chunk,
    id::{IdGenerator, SegmentId},
    mutation::{ColumnFamilyId, FlushExecutor, ReplayPosition},
    Config,
};
use byteorder::{LittleEndian, ReadBytesExt};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

/// The outcome of the recovery scan: slots found occupied on disk, paired
/// with the segment id the bookkeeping block recorded for them.
pub(crate) type UncommittedSlots = Vec<(u32, SegmentId)>;

struct Inner {
    /// `Some` for every occupied slot, `None` for a free one, indexed by slot.
    segments: Vec<Option<Arc<Segment>>>,

    /// Free slot indices, oldest-recycled-first is not required; any order.
    free_list: VecDeque<u32>,

    /// Slot indices holding the currently active segment, if any.
    active_slot: Option<u32>,

    /// Reused scratch buffer for bookkeeping block I/O (§9, Open Question:
    /// "owned strictly by the lock-holder and reset on entry").
    bookkeeping_scratch: [u8; BLOCK_SIZE],
}

/// Owns the segment ring, the free-list, the active pointer, and the
/// bookkeeping chunk.
pub struct SegmentManager {
    inner: Mutex<Inner>,
    /// Signalled whenever a slot is returned to the free-list, so a blocked
    /// `allocate` call can recheck it (§5: "the free-list, blocks on take
    /// when empty").
    free_list_available: Condvar,
    ids: IdGenerator,
    bookkeeping_chunk: Arc<dyn Chunk>,
    start_offset: u64,
    max_segments: u32,
    blocks_per_segment: u32,
    emergency_valve: f32,
    flush_executor: Arc<dyn FlushExecutor>,
}

impl SegmentManager {
    /// Offset of the first data block, i.e. `start_offset + max_segments`.
    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.start_offset + u64::from(self.max_segments)
    }

    /// The physical start block for slot `slot`.
    #[must_use]
    pub fn slot_block_address(&self, slot: u32) -> u64 {
        self.data_offset() + u64::from(slot) * u64::from(self.blocks_per_segment)
    }

    /// Scans the bookkeeping region and constructs a manager. Does not
    /// activate a segment; the caller (the [`crate::CommitLog`] facade)
    /// drives [`Replayer`](crate::replay::Replayer) first.
    ///
    /// Returns the manager alongside the slots recovery must still process.
    pub fn recover(
        config: &Config,
        bookkeeping_chunk: Arc<dyn Chunk>,
        flush_executor: Arc<dyn FlushExecutor>,
    ) -> crate::Result<(Self, UncommittedSlots)> {
        let max_segments = config.max_segments();
        let mut scratch = vec![0u8; max_segments as usize * BLOCK_SIZE];
        bookkeeping_chunk.read_block(config.start_offset(), &mut scratch)?;

        let mut segments = Vec::with_capacity(max_segments as usize);
        let mut free_list = VecDeque::new();
        let mut uncommitted = Vec::new();
        let mut highest_seen_id = 0u64;

        for slot in 0..max_segments {
            let block = &scratch[slot as usize * BLOCK_SIZE..(slot as usize + 1) * BLOCK_SIZE];
            let mut id_bytes = &block[0..8];
            let segment_id = id_bytes
                .read_u64::<LittleEndian>()
                .expect("8 bytes available");

            if segment_id == 0 {
                free_list.push_back(slot);
                segments.push(None);
            } else {
                highest_seen_id = highest_seen_id.max(segment_id);
                let segment = Arc::new(Segment::new(slot, segment_id, config.blocks_per_segment()));
                segments.push(Some(segment));
                uncommitted.push((slot, segment_id));
            }
        }

        log::info!(
            "recovered bookkeeping region: {} free slots, {} occupied",
            free_list.len(),
            uncommitted.len()
        );

        let manager = Self {
            inner: Mutex::new(Inner {
                segments,
                free_list,
                active_slot: None,
                bookkeeping_scratch: [0u8; BLOCK_SIZE],
            }),
            free_list_available: Condvar::new(),
            ids: IdGenerator::new(highest_seen_id + 1),
            bookkeeping_chunk,
            start_offset: config.start_offset(),
            max_segments,
            blocks_per_segment: config.blocks_per_segment(),
            emergency_valve: config.emergency_valve(),
            flush_executor,
        };

        Ok((manager, uncommitted))
    }

    /// The segment occupying `slot`, if any (used by the replayer to scan
    /// recovered segments before they are wired into the active list).
    #[must_use]
    pub(crate) fn segment_at(&self, slot: u32) -> Option<Arc<Segment>> {
        self.inner.lock().expect("lock poisoned").segments[slot as usize].clone()
    }

    /// Activates the next segment: takes a slot from the free-list, blocking
    /// the caller (and releasing the manager lock while waiting) if none is
    /// free, mints a fresh id, writes the bookkeeping block, and installs it
    /// as active (§4.2, §5: "the free-list, blocks on take when empty").
    ///
    /// Takes the manager lock's guard by value and hands it back alongside
    /// the activated segment, since waiting on [`Self::free_list_available`]
    /// requires giving up and reacquiring the guard itself.
    fn activate_next_segment<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
    ) -> crate::Result<(MutexGuard<'a, Inner>, Arc<Segment>)> {
        if (inner.free_list.len() as u32) < self.emergency_threshold() {
            self.flush_oldest_keyspaces(&inner);
        }

        loop {
            let Some(slot) = inner.free_list.pop_front() else {
                log::warn!("free-list exhausted; blocking for a slot to be recycled");
                inner = self.free_list_available.wait(inner).expect("lock poisoned");
                continue;
            };

            let segment_id = self.ids.next();

            inner.bookkeeping_scratch = [0u8; BLOCK_SIZE];
            inner.bookkeeping_scratch[0..8].copy_from_slice(&segment_id.to_le_bytes());
            self.bookkeeping_chunk.write_block(
                self.start_offset + u64::from(slot),
                &inner.bookkeeping_scratch,
            )?;

            let segment = Arc::new(Segment::new(slot, segment_id, self.blocks_per_segment));
            inner.segments[slot as usize] = Some(segment.clone());
            inner.active_slot = Some(slot);

            log::debug!("activated segment {segment_id} in slot {slot}");

            return Ok((inner, segment));
        }
    }

    fn emergency_threshold(&self) -> u32 {
        (self.max_segments as f32 * self.emergency_valve).ceil() as u32
    }

    fn flush_oldest_keyspaces(&self, inner: &Inner) {
        let Some(oldest) = inner.segments.iter().flatten().min_by_key(|s| s.id) else {
            return;
        };

        let dirty = oldest.dirty.lock().expect("lock poisoned");
        for &cf in dirty.keys() {
            self.flush_executor.request_flush(cf);
        }
    }

    /// Allocates `block_count` blocks for `cf_id`, activating a new segment
    /// first if necessary. Returns `(segment, starting_block)`.
    pub fn allocate(
        &self,
        block_count: u32,
        cf_id: ColumnFamilyId,
    ) -> crate::Result<(Arc<Segment>, u32)> {
        let inner = self.inner.lock().expect("lock poisoned");

        let existing = inner
            .active_slot
            .and_then(|slot| inner.segments[slot as usize].clone())
            .filter(|segment| segment.remaining_capacity() >= block_count);

        let active = match existing {
            Some(segment) => segment,
            None => self.activate_next_segment(inner)?.1,
        };

        let starting_block = active.reserve(block_count);
        active.mark_dirty(cf_id, starting_block + block_count);

        Ok((active, starting_block))
    }

    /// Marks `cf_id` clean in `segment` up to `watermark` (§4.2).
    pub fn mark_clean(&self, segment: &Segment, cf_id: ColumnFamilyId, watermark: ReplayPosition) {
        segment.mark_clean(cf_id, watermark);
    }

    /// A snapshot of the active segments list, oldest first by segment id.
    #[must_use]
    pub fn active_segments_oldest_first(&self) -> Vec<Arc<Segment>> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut segments: Vec<_> = inner.segments.iter().flatten().cloned().collect();
        segments.sort_by_key(|s| s.id);
        segments
    }

    /// The number of segments currently occupying a slot (§10.6).
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").segments.iter().flatten().count()
    }

    /// The number of slots currently on the free-list.
    #[must_use]
    pub fn free_segment_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").free_list.len()
    }

    /// Total bytes written so far across every occupied segment (the sum of
    /// each segment's write cursor times the block size), i.e. disk space
    /// actually used rather than reserved (§10.6).
    #[must_use]
    pub fn disk_space_used(&self) -> u64 {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .segments
            .iter()
            .flatten()
            .map(|s| u64::from(s.cursor()) * BLOCK_SIZE as u64)
            .sum()
    }

    /// Recycles `segment`: removes it from the active list, zeroes its
    /// bookkeeping block, and returns its slot to the free-list (§4.2).
    pub fn recycle_segment(&self, segment: &Segment) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        self.recycle_segment_locked(&mut inner, segment.slot)
    }

    fn recycle_segment_locked(&self, inner: &mut Inner, slot: u32) -> crate::Result<()> {
        inner.bookkeeping_scratch = [0u8; BLOCK_SIZE];
        self.bookkeeping_chunk.write_block(
            self.start_offset + u64::from(slot),
            &inner.bookkeeping_scratch,
        )?;

        inner.segments[slot as usize] = None;
        inner.free_list.push_back(slot);
        self.free_list_available.notify_one();

        log::debug!("recycled slot {slot}");

        Ok(())
    }

    /// Marks every segment clean for each CF in `dropped_cfs`, then recycles
    /// every segment that is now unused (§4.2, `forceRecycleAll`).
    pub fn force_recycle_all(&self, dropped_cfs: &[ColumnFamilyId]) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");

        let candidates: Vec<(u32, bool)> = inner
            .segments
            .iter()
            .flatten()
            .map(|s| {
                s.drop_cfs(dropped_cfs);
                (s.slot, s.is_unused())
            })
            .collect();

        for (slot, unused) in candidates {
            if unused && inner.active_slot != Some(slot) {
                self.recycle_segment_locked(&mut inner, slot)?;
            }
        }

        Ok(())
    }

    /// Zeroes every bookkeeping block for `slots` and returns them to the
    /// free-list (§4.2, `recycleAfterReplay`). Called once, after the
    /// replayer has finished scanning every uncommitted slot.
    pub fn recycle_after_replay(&self, slots: &[u32]) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        for &slot in slots {
            inner.bookkeeping_scratch = [0u8; BLOCK_SIZE];
            self.bookkeeping_chunk
                .write_block(self.start_offset + u64::from(slot), &inner.bookkeeping_scratch)?;
            inner.segments[slot as usize] = None;
            inner.free_list.push_back(slot);
        }

        if !slots.is_empty() {
            self.free_list_available.notify_all();
        }

        log::info!("recycled {} slot(s) after replay", slots.len());

        Ok(())
    }

    /// Verifies the on-flash bookkeeping region matches the in-memory
    /// free-list complement (P4). Intended for tests.
    #[cfg(test)]
    pub(crate) fn bookkeeping_matches_memory(&self) -> crate::Result<bool> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut scratch = vec![0u8; self.max_segments as usize * BLOCK_SIZE];
        self.bookkeeping_chunk
            .read_block(self.start_offset, &mut scratch)?;

        for slot in 0..self.max_segments {
            let block = &scratch[slot as usize * BLOCK_SIZE..(slot as usize + 1) * BLOCK_SIZE];
            let mut id_bytes = &block[0..8];
            let on_disk_id = id_bytes.read_u64::<LittleEndian>().expect("8 bytes available");
            let in_memory = &inner.segments[slot as usize];

            match in_memory {
                Some(segment) if segment.id == on_disk_id => {}
                None if on_disk_id == 0 => {}
                _ => return Ok(false),
            }
        }

        Ok(true)
    }
}
