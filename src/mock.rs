// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! In-process stand-ins for the external collaborators of §6, used by
//! tests in place of a real catalog, mutation codec, and apply/flush
//! executors.

use crate::mutation::{
    Catalog, ColumnFamilyId, FlushExecutor, MutationApplier, MutationCodec, ReplayPosition,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

/// A trivial [`MutationCodec`] whose "payload" is a single `(cf, bytes)`
/// pair, length-prefixed. Good enough for tests that don't care about
/// multi-CF batching.
#[derive(Clone, Copy, Default)]
pub struct MockMutationCodec;

impl MutationCodec for MockMutationCodec {
    fn decode(&self, payload: &[u8]) -> Vec<(ColumnFamilyId, Vec<u8>)> {
        if payload.len() < 8 {
            return Vec::new();
        }
        let mut cf_bytes = [0u8; 8];
        cf_bytes.copy_from_slice(&payload[0..8]);
        let cf = u64::from_be_bytes(cf_bytes);
        vec![(cf, payload[8..].to_vec())]
    }

    fn encode_filtered(&self, parts: &[(ColumnFamilyId, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (cf, bytes) in parts {
            out.extend_from_slice(&cf.to_be_bytes());
            out.extend_from_slice(bytes);
        }
        out
    }
}

/// An in-memory [`Catalog`]: a fixed schema plus mutable per-CF flush and
/// truncation watermarks, settable by tests.
#[derive(Default)]
pub struct MockCatalog {
    schema: RwLock<HashMap<ColumnFamilyId, ()>>,
    flushed_through: RwLock<HashMap<ColumnFamilyId, ReplayPosition>>,
    truncated_at: RwLock<HashMap<ColumnFamilyId, ReplayPosition>>,
}

impl MockCatalog {
    /// Registers `cf` in the schema with a zero flush watermark.
    pub fn add_column_family(&self, cf: ColumnFamilyId) {
        self.schema.write().expect("lock poisoned").insert(cf, ());
    }

    /// Records that `cf` is flushed through `position`.
    pub fn set_flushed_through(&self, cf: ColumnFamilyId, position: ReplayPosition) {
        self.flushed_through
            .write()
            .expect("lock poisoned")
            .insert(cf, position);
    }

    /// Records a truncation watermark for `cf`.
    pub fn set_truncated_at(&self, cf: ColumnFamilyId, position: ReplayPosition) {
        self.truncated_at
            .write()
            .expect("lock poisoned")
            .insert(cf, position);
    }

    /// Drops `cf` from the schema, as `forceRecycleAll` would expect.
    pub fn drop_column_family(&self, cf: ColumnFamilyId) {
        self.schema.write().expect("lock poisoned").remove(&cf);
    }
}

impl Catalog for MockCatalog {
    fn column_families(&self) -> Vec<ColumnFamilyId> {
        self.schema.read().expect("lock poisoned").keys().copied().collect()
    }

    fn exists(&self, cf: ColumnFamilyId) -> bool {
        self.schema.read().expect("lock poisoned").contains_key(&cf)
    }

    fn flushed_through(&self, cf: ColumnFamilyId) -> ReplayPosition {
        self.flushed_through
            .read()
            .expect("lock poisoned")
            .get(&cf)
            .copied()
            .unwrap_or(ReplayPosition::ZERO)
    }

    fn truncated_at(&self, cf: ColumnFamilyId) -> Option<ReplayPosition> {
        self.truncated_at.read().expect("lock poisoned").get(&cf).copied()
    }
}

/// Records every `apply` call it receives, for assertions in tests.
#[derive(Default)]
pub struct MockMutationApplier {
    applied: Mutex<Vec<(Vec<u8>, ReplayPosition)>>,
    flushed: Mutex<Vec<ColumnFamilyId>>,
}

impl MockMutationApplier {
    /// Returns a snapshot of everything applied so far.
    #[must_use]
    pub fn applied(&self) -> Vec<(Vec<u8>, ReplayPosition)> {
        self.applied.lock().expect("lock poisoned").clone()
    }

    /// Returns the column families flushed so far, in request order.
    #[must_use]
    pub fn flushed(&self) -> Vec<ColumnFamilyId> {
        self.flushed.lock().expect("lock poisoned").clone()
    }
}

impl MutationApplier for MockMutationApplier {
    fn apply(&self, payload: &[u8], position: ReplayPosition) {
        self.applied
            .lock()
            .expect("lock poisoned")
            .push((payload.to_vec(), position));
    }

    fn drain(&self) {}

    fn flush(&self, cf: ColumnFamilyId) {
        self.flushed.lock().expect("lock poisoned").push(cf);
    }
}

/// Records every flush request it receives.
#[derive(Default)]
pub struct MockFlushExecutor {
    requested: Mutex<Vec<ColumnFamilyId>>,
}

impl MockFlushExecutor {
    /// Returns the column families whose flush was requested, in order.
    #[must_use]
    pub fn requested(&self) -> Vec<ColumnFamilyId> {
        self.requested.lock().expect("lock poisoned").clone()
    }
}

impl FlushExecutor for MockFlushExecutor {
    fn request_flush(&self, cf: ColumnFamilyId) {
        self.requested.lock().expect("lock poisoned").push(cf);
    }
}

/// Shareable handle to a [`MockFlushExecutor`], for tests that need to hold
/// onto it after handing an `Arc<dyn FlushExecutor>` to a [`crate::CommitLog`].
pub type SharedMockFlushExecutor = Arc<MockFlushExecutor>;
