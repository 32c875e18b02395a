// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A fixed-size pool of pre-constructed workers (§4.3). Each worker owns a
//! device chunk handle (pinned round-robin at startup) and a direct-mapped
//! staging buffer. The pool doubles as a semaphore: workers live on a
//! bounded channel, borrow = receive, return = send, and "all workers idle"
//! is exactly "the channel is full" again.
//!
//! This crate takes the simpler of the two shapes the design notes permit
//! (§9): no separate executor. `CommitLog::add` borrows a worker and runs
//! the write synchronously on the caller's thread, then returns it.

use crate::{
    config::BLOCK_SIZE,
    device::Chunk,
    id::SegmentId,
    record::RecordFramer,
    Config,
};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};

/// One pre-allocated append worker: a device chunk plus a reusable staging
/// buffer sized to hold `buffer_block_capacity` blocks.
pub(crate) struct AppendWorker {
    chunk: Arc<dyn Chunk>,
    staging: Vec<u8>,
    buffer_block_capacity: u32,
}

impl AppendWorker {
    fn new(chunk: Arc<dyn Chunk>, buffer_block_capacity: u32) -> Self {
        Self {
            chunk,
            staging: Vec::with_capacity(buffer_block_capacity as usize * BLOCK_SIZE),
            buffer_block_capacity,
        }
    }

    /// Serializes `payload` for `segment_id` into the staging buffer, then
    /// writes it to `physical_start_block` on this worker's device chunk
    /// (§4.3, steps 2-3).
    pub(crate) fn write_record(
        &mut self,
        segment_id: SegmentId,
        payload: &[u8],
        physical_start_block: u64,
    ) -> crate::Result<u32> {
        let block_count = RecordFramer::encode(
            segment_id,
            payload,
            self.buffer_block_capacity,
            &mut self.staging,
        )?;

        self.chunk.write_block(physical_start_block, &self.staging)?;

        Ok(block_count)
    }
}

/// A bounded pool of [`AppendWorker`]s. The channel capacity equals `T`; a
/// full channel means every worker is idle.
pub(crate) struct AppendWorkerPool {
    sender: Sender<AppendWorker>,
    receiver: Receiver<AppendWorker>,
    capacity: usize,
    idle_gate: Arc<(Mutex<usize>, Condvar)>,
}

impl AppendWorkerPool {
    /// Builds `config.threads()` workers, opening their device chunks
    /// round-robin across `config.devices()` (§4.3).
    pub(crate) fn new(config: &Config, device: &dyn crate::device::BlockDevice) -> crate::Result<Self> {
        let capacity = config.threads();
        let (sender, receiver) = crossbeam_channel::bounded(capacity);

        for index in 0..capacity {
            let device_name = &config.devices()[index % config.devices().len()];
            let chunk = device.open_chunk(device_name, None)?;
            let worker = AppendWorker::new(chunk, config.buffer_block_capacity());
            sender.send(worker).expect("channel sized to capacity");
        }

        Ok(Self {
            sender,
            receiver,
            capacity,
            idle_gate: Arc::new((Mutex::new(capacity), Condvar::new())),
        })
    }

    /// Borrows a worker, blocking until one is idle.
    pub(crate) fn borrow(&self) -> AppendWorker {
        let worker = self.receiver.recv().expect("sender outlives receiver");
        let mut idle = self.idle_gate.0.lock().expect("lock poisoned");
        *idle -= 1;
        worker
    }

    /// Returns a worker to the pool, waking anyone waiting for full
    /// idleness if this return makes the pool full again.
    pub(crate) fn give_back(&self, worker: AppendWorker) {
        self.sender.send(worker).expect("receiver outlives sender");
        let (lock, condvar) = &*self.idle_gate;
        let mut idle = lock.lock().expect("lock poisoned");
        *idle += 1;
        if *idle == self.capacity {
            condvar.notify_all();
        }
    }

    /// Blocks until every worker is idle (§4.4, "queue-full wait
    /// protocol"), used by `discardCompletedSegments` and `getContext` to
    /// observe a consistent dirty-map snapshot.
    pub(crate) fn await_idle(&self) {
        let (lock, condvar) = &*self.idle_gate;
        let guard = lock.lock().expect("lock poisoned");
        let _guard = condvar
            .wait_while(guard, |idle| *idle != self.capacity)
            .expect("lock poisoned");
    }

    /// Drains every worker out of the pool, closing its device chunk, and
    /// leaves the pool empty (§4.4 `shutdown`).
    pub(crate) fn shutdown(&self) -> crate::Result<()> {
        self.await_idle();
        for _ in 0..self.capacity {
            let worker = self.receiver.recv().expect("sender outlives receiver");
            worker.chunk.close()?;
        }
        Ok(())
    }
}
