//! Active batches, keyed by id, with every mutation mirrored to the sink.

use crate::models::{
    asset::AssetRef,
    batch::{BatchId, BatchSnapshot, OwnerId, UploadBatch, Visibility},
};
use crate::services::state_sink::StateSink;
use chrono::Utc;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Clone, Default)]
pub(crate) struct BatchRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    sink: StateSink,
}

#[derive(Default)]
struct RegistryInner {
    batches: BTreeMap<BatchId, UploadBatch>,
    /// Bumped on every mutation; orders snapshots in the sink.
    version: u64,
    /// Last id handed out, so ids stay unique within one millisecond.
    last_issued: i64,
}

impl RegistryInner {
    fn snapshots(&self) -> Vec<BatchSnapshot> {
        self.batches.values().map(UploadBatch::snapshot).collect()
    }

    fn bump(&mut self) -> (u64, Vec<BatchSnapshot>) {
        self.version += 1;
        (self.version, self.snapshots())
    }
}

impl BatchRegistry {
    pub(crate) fn new(sink: StateSink) -> Self {
        Self {
            inner: Arc::default(),
            sink,
        }
    }

    pub(crate) fn sink(&self) -> &StateSink {
        &self.sink
    }

    /// Issue an id, register a fresh batch and publish it.
    pub(crate) fn create(
        &self,
        owner: OwnerId,
        visibility: Visibility,
        assets: Vec<AssetRef>,
    ) -> UploadBatch {
        let (batch, version, snapshots) = {
            let mut inner = self.inner.write();
            let millis = Utc::now().timestamp_millis().max(inner.last_issued + 1);
            inner.last_issued = millis;

            let batch = UploadBatch::new(BatchId::from_millis(millis), owner, visibility, assets);
            inner.batches.insert(batch.id, batch.clone());
            let (version, snapshots) = inner.bump();
            (batch, version, snapshots)
        };
        self.sink.publish(version, snapshots);
        batch
    }

    /// Mutate a batch in place. `f` returns whether anything changed; only
    /// changes are published. `None` when the batch is not active.
    pub(crate) fn update<F>(&self, id: BatchId, f: F) -> Option<bool>
    where
        F: FnOnce(&mut UploadBatch) -> bool,
    {
        let (version, snapshots) = {
            let mut inner = self.inner.write();
            let batch = inner.batches.get_mut(&id)?;
            if !f(batch) {
                return Some(false);
            }
            inner.bump()
        };
        self.sink.publish(version, snapshots);
        Some(true)
    }

    pub(crate) fn remove(&self, id: BatchId) -> Option<UploadBatch> {
        let (removed, version, snapshots) = {
            let mut inner = self.inner.write();
            let removed = inner.batches.remove(&id)?;
            let (version, snapshots) = inner.bump();
            (removed, version, snapshots)
        };
        self.sink.publish(version, snapshots);
        Some(removed)
    }

    pub(crate) fn get(&self, id: BatchId) -> Option<UploadBatch> {
        self.inner.read().batches.get(&id).cloned()
    }

    pub(crate) fn snapshots(&self) -> Vec<BatchSnapshot> {
        self.inner.read().snapshots()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.read().batches.is_empty()
    }
}
