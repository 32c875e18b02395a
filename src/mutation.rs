// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! External collaborators named in §6 but not specified here: mutation
//! serialization, column-family schema/flush-position lookups, and the
//! mutation-apply executor. Each crosses the core's boundary as a trait
//! rather than a concrete owned type, the way an index reader/writer pair
//! crosses the boundary of a value-log style storage engine.

use crate::id::SegmentId;

/// Identifies a column family. Opaque to this crate.
#[allow(clippy::module_name_repetitions)]
pub type ColumnFamilyId = u64;

/// A `(segment_id, block_offset)` watermark (§3).
///
/// Forms a total order: segment id first, then in-segment block offset.
/// "Mutations at positions `>= this one` may still need replay."
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ReplayPosition {
    /// The segment this position falls in.
    pub segment_id: SegmentId,
    /// The block offset within that segment.
    pub block_offset: u32,
}

impl ReplayPosition {
    /// The position before anything has ever been written.
    pub const ZERO: Self = Self {
        segment_id: 0,
        block_offset: 0,
    };

    /// Creates a new replay position.
    #[must_use]
    pub fn new(segment_id: SegmentId, block_offset: u32) -> Self {
        Self {
            segment_id,
            block_offset,
        }
    }

    /// Whether `self` (a flush/truncation watermark) covers `other` (a
    /// record's position), i.e. `other` never needs replaying.
    #[must_use]
    pub fn covers(self, other: Self) -> bool {
        self >= other
    }
}

/// Splits a raw, already-serialized mutation payload into its constituent
/// column-family sub-mutations, and rebuilds a payload from a filtered
/// subset of them. The format itself (§1, "Mutation serialization format")
/// is out of scope; only this seam is.
pub trait MutationCodec: Send + Sync {
    /// Splits `payload` into `(column_family, sub_mutation_bytes)` pairs, in
    /// the order they must be re-applied.
    fn decode(&self, payload: &[u8]) -> Vec<(ColumnFamilyId, Vec<u8>)>;

    /// Rebuilds a payload containing only the given sub-mutations.
    fn encode_filtered(&self, parts: &[(ColumnFamilyId, Vec<u8>)]) -> Vec<u8>;
}

/// The external catalog: column-family schema and per-CF flush watermarks.
pub trait Catalog: Send + Sync {
    /// Returns every column family's id as of now.
    fn column_families(&self) -> Vec<ColumnFamilyId>;

    /// Whether `cf` still exists in the schema (§4.5: dropped CFs are skipped).
    fn exists(&self, cf: ColumnFamilyId) -> bool;

    /// The position this CF's on-disk tables are already flushed through.
    fn flushed_through(&self, cf: ColumnFamilyId) -> ReplayPosition;

    /// An optional "truncated at" position that bumps the floor forward
    /// regardless of what is actually flushed (`SystemKeyspace.getTruncatedPosition`).
    fn truncated_at(&self, cf: ColumnFamilyId) -> Option<ReplayPosition>;

    /// The per-CF replay floor: the later of `flushed_through` and `truncated_at`.
    fn replay_floor(&self, cf: ColumnFamilyId) -> ReplayPosition {
        let flushed = self.flushed_through(cf);
        match self.truncated_at(cf) {
            Some(truncated) if truncated > flushed => truncated,
            _ => flushed,
        }
    }
}

/// The external mutation-apply executor (`Stage = MUTATION`), used only
/// during replay fan-out (§4.5).
pub trait MutationApplier: Send + Sync {
    /// Applies a filtered, surviving mutation at the given position.
    fn apply(&self, payload: &[u8], position: ReplayPosition);

    /// Blocks until every `apply` call submitted so far has completed.
    fn drain(&self);

    /// Requests (and waits for) a flush of the given column family, used by
    /// `blockForWrites` once replay has finished dispatching mutations.
    fn flush(&self, cf: ColumnFamilyId);
}

/// The external "optional tasks" executor used for emergency-valve flush
/// requests (§4.2). Must run disjoint from the worker pool and from caller
/// threads (§9), or a caller holding a database-level lock can deadlock
/// against its own commit-log write.
pub trait FlushExecutor: Send + Sync {
    /// Enqueues (without blocking) a flush request for `cf`.
    fn request_flush(&self, cf: ColumnFamilyId);
}
