// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::version::Version;

/// Represents errors that can occur in the commit log
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error talking to a block device
    Io(std::io::Error),

    /// Invalid data format version
    InvalidVersion(Option<Version>),

    /// A record's framed size exceeds both the per-segment and per-worker-buffer caps
    RecordTooLarge {
        /// Blocks the record would occupy
        block_count: u32,
        /// Blocks available in the active segment
        segment_capacity: u32,
        /// Blocks available in a worker's staging buffer
        buffer_capacity: u32,
    },

    /// A write was attempted after [`crate::CommitLog::shutdown`] closed the device chunks
    DeviceClosed,

    /// The bookkeeping region is inconsistent with the in-memory free-list; fatal, since
    /// the log's notion of which slots are occupied can no longer be trusted
    BookkeepingCorrupt(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommitLogError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidVersion(_)
            | Self::RecordTooLarge { .. }
            | Self::DeviceClosed
            | Self::BookkeepingCorrupt(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Commit log result
pub type Result<T> = std::result::Result<T, Error>;
