// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The block device is an external collaborator (§6): a raw 4 KiB-block
//! read/write surface on one or more named devices. Its internals
//! (the driver, wear-levelling, DMA) are out of scope; this module only
//! states the capability set the rest of the crate depends on, plus an
//! in-memory implementation for tests, standing in for a real flash device
//! the way [`crate::mock`] stands in for the catalog and apply executors.

use crate::config::BLOCK_SIZE;
use std::sync::{Arc, Mutex};

/// A future returned by [`Chunk::write_block_async`].
///
/// Kept deliberately minimal: this crate's append path (§9, "Decision") runs
/// writes synchronously on the caller's thread, so the async variant exists
/// only to keep the capability set of §6 complete for other callers.
pub trait DeviceFuture: Send {
    /// Blocks until the write this future represents has completed.
    fn wait(self: Box<Self>) -> crate::Result<()>;
}

/// An open handle to one named device, addressed in 4 KiB blocks.
pub trait Chunk: Send + Sync {
    /// Reads `buf.len() / BLOCK_SIZE` blocks starting at `start_lba` into `buf`.
    fn read_block(&self, start_lba: u64, buf: &mut [u8]) -> crate::Result<()>;

    /// Writes `buf.len() / BLOCK_SIZE` blocks starting at `start_lba` from `buf`.
    fn write_block(&self, start_lba: u64, buf: &[u8]) -> crate::Result<()>;

    /// Submits an asynchronous write, returning a future to await completion.
    fn write_block_async(&self, start_lba: u64, buf: Vec<u8>) -> crate::Result<Box<dyn DeviceFuture>>;

    /// Releases the chunk handle.
    fn close(&self) -> crate::Result<()>;
}

/// Opens [`Chunk`] handles by device name.
pub trait BlockDevice: Send + Sync {
    /// Opens a chunk on the named device.
    ///
    /// `max_async` bounds the number of in-flight `write_block_async` calls
    /// the returned chunk will accept; implementations that are purely
    /// synchronous may ignore it.
    fn open_chunk(&self, device_name: &str, max_async: Option<usize>) -> crate::Result<Arc<dyn Chunk>>;
}

struct InMemoryChunkInner {
    bytes: Mutex<Vec<u8>>,
}

/// An in-memory [`Chunk`], backed by a plain byte buffer.
///
/// Used by unit and integration tests in place of a real flash device.
pub struct InMemoryChunk(Arc<InMemoryChunkInner>);

impl Clone for InMemoryChunk {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl InMemoryChunk {
    fn new(block_capacity: u64) -> Self {
        Self(Arc::new(InMemoryChunkInner {
            bytes: Mutex::new(vec![0u8; block_capacity as usize * BLOCK_SIZE]),
        }))
    }

    /// Flips a single byte somewhere inside the given block, simulating a
    /// torn write or bit-rot for corruption tests (§8 scenario S5).
    pub fn corrupt_byte(&self, lba: u64, byte_offset_in_block: usize) {
        let mut bytes = self.0.bytes.lock().expect("lock poisoned");
        let index = lba as usize * BLOCK_SIZE + byte_offset_in_block;
        bytes[index] ^= 0xFF;
    }

    fn bounds_check(&self, start_lba: u64, len: usize) -> crate::Result<()> {
        if len % BLOCK_SIZE != 0 {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "buffer length is not a multiple of the block size",
            )));
        }

        let bytes = self.0.bytes.lock().expect("lock poisoned");
        let end = start_lba as usize * BLOCK_SIZE + len;

        if end > bytes.len() {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "block range exceeds device capacity",
            )));
        }

        Ok(())
    }
}

impl Chunk for InMemoryChunk {
    fn read_block(&self, start_lba: u64, buf: &mut [u8]) -> crate::Result<()> {
        self.bounds_check(start_lba, buf.len())?;

        let bytes = self.0.bytes.lock().expect("lock poisoned");
        let start = start_lba as usize * BLOCK_SIZE;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);

        Ok(())
    }

    fn write_block(&self, start_lba: u64, buf: &[u8]) -> crate::Result<()> {
        self.bounds_check(start_lba, buf.len())?;

        let mut bytes = self.0.bytes.lock().expect("lock poisoned");
        let start = start_lba as usize * BLOCK_SIZE;
        bytes[start..start + buf.len()].copy_from_slice(buf);

        Ok(())
    }

    fn write_block_async(&self, start_lba: u64, buf: Vec<u8>) -> crate::Result<Box<dyn DeviceFuture>> {
        self.write_block(start_lba, &buf)?;
        Ok(Box::new(CompletedFuture))
    }

    fn close(&self) -> crate::Result<()> {
        Ok(())
    }
}

struct CompletedFuture;

impl DeviceFuture for CompletedFuture {
    fn wait(self: Box<Self>) -> crate::Result<()> {
        Ok(())
    }
}

/// An in-memory [`BlockDevice`].
///
/// A named `devices` list (§6) models multiple channels onto the *same*
/// backing medium — the way a flash controller exposes several queues onto
/// one namespace, which is what lets [`crate::CommitLog`] address a slot by
/// the same `DATA_OFFSET + slot·K + offset` regardless of which worker (and
/// therefore which device name) performs the write. Accordingly every
/// `open_chunk` call here returns a handle onto one shared byte buffer,
/// whatever name is requested.
///
/// The buffer must hold at least
/// `start_offset + max_segments + max_segments * blocks_per_segment` blocks
/// for a [`crate::CommitLog`] configured against it to have room.
#[derive(Clone)]
pub struct InMemoryDevice {
    chunk: InMemoryChunk,
}

impl InMemoryDevice {
    /// Creates a device with room for `block_capacity` blocks.
    #[must_use]
    pub fn new(block_capacity: u64) -> Self {
        Self {
            chunk: InMemoryChunk::new(block_capacity),
        }
    }

    /// Returns a handle to the underlying in-memory chunk for fault injection.
    #[must_use]
    pub fn chunk(&self, _device_name: &str) -> InMemoryChunk {
        self.chunk.clone()
    }
}

impl BlockDevice for InMemoryDevice {
    fn open_chunk(&self, device_name: &str, _max_async: Option<usize>) -> crate::Result<Arc<dyn Chunk>> {
        Ok(Arc::new(self.chunk(device_name)))
    }
}
