// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A write-ahead commit log over raw, block-addressable flash storage.
//!
//! The log is built from three pieces:
//!
//! - [`RecordFramer`] (see [`record`]), a stateless encoder/decoder for one
//!   on-flash frame: a checksummed header, an opaque payload, and a
//!   checksummed trailer.
//! - [`segment::manager::SegmentManager`], which owns a fixed ring of `N`
//!   segments, each `K` blocks, tracked by a small on-device bookkeeping
//!   region and an in-memory free-list.
//! - [`replay::Replayer`], which scans whatever segments bookkeeping marks
//!   as occupied at startup and replays their un-flushed records before the
//!   log accepts new appends.
//!
//! [`CommitLog`] ties these together behind a small facade: [`CommitLog::add`]
//! frames and writes one mutation, returning the [`ReplayPosition`] it is now
//! covered by; [`CommitLog::discard_completed_segments`] recycles segments
//! once their data is durably reflected elsewhere; [`CommitLog::recover`]
//! performs the startup scan and replay in one call.
//!
//! This crate does not know how to serialize a mutation, look up a
//! column family's flush watermark, or apply a replayed mutation back into
//! a table — those cross the boundary as the [`mutation::MutationCodec`],
//! [`mutation::Catalog`], and [`mutation::MutationApplier`] traits (§6),
//! the same way the host database's column families and schema live
//! outside this crate.
//!
//! # Example usage
//!
//! ```
//! use flashlog::{CommitLog, Config};
//! use flashlog::device::InMemoryDevice;
//! use flashlog::mock::{MockCatalog, MockFlushExecutor, MockMutationApplier, MockMutationCodec};
//! use std::sync::Arc;
//!
//! # fn main() -> flashlog::Result<()> {
//! let config = Config::new(vec!["dev0".into()])
//!     .max_segments(8)
//!     .blocks_per_segment(32);
//! let device = InMemoryDevice::new(8 + 8 * 32);
//!
//! let codec = MockMutationCodec;
//! let catalog = MockCatalog::default();
//! let applier = MockMutationApplier::default();
//! let flusher = Arc::new(MockFlushExecutor::default());
//!
//! let (log, replayed) = CommitLog::recover(&config, &device, &codec, &catalog, &applier, flusher)?;
//! assert_eq!(replayed, 0);
//!
//! let position = log.add(b"hello, flash", 1)?;
//! assert_eq!(position.segment_id, 1);
//!
//! log.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::missing_const_for_fn)]
// Raw block/record parsing below is slice-index-heavy by nature; a blanket
// deny doesn't fit this domain. See DESIGN.md.
#![allow(clippy::indexing_slicing)]

mod commit_log;
mod config;
pub mod device;
mod error;
mod id;
pub mod mock;
pub mod mutation;
mod record;
mod replay;
mod segment;
mod version;
mod worker;

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

pub use {
    commit_log::CommitLog,
    config::Config,
    error::{Error, Result},
    id::{IdGenerator, SegmentId},
    mutation::{ColumnFamilyId, ReplayPosition},
    record::RecordFramer,
    segment::{manager::SegmentManager, Segment},
    version::Version,
};

#[doc(hidden)]
pub use record::Decoded;
