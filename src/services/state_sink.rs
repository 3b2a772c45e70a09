//! Observable mirror of the active batches.
//!
//! Every change to the set of active batches is published as a full
//! snapshot, synchronously, to each subscriber. Nothing is coalesced, so the
//! last snapshot seen before a batch disappears is its settled state.
//!
//! Snapshots carry the registry version they were taken at; a snapshot older
//! than one already delivered is discarded, so subscribers never move
//! backwards when publishers race on different threads.

use crate::models::batch::BatchSnapshot;
use parking_lot::{ReentrantMutex, RwLock};
use std::sync::{Arc, Weak};

/// Callback invoked with the current active batches.
pub type SnapshotCallback = Arc<dyn Fn(&[BatchSnapshot]) + Send + Sync>;

#[derive(Clone, Default)]
pub struct StateSink {
    inner: Arc<RwLock<SinkInner>>,
    /// Serializes delivery; reentrant so a callback may trigger a publish.
    delivery: Arc<ReentrantMutex<()>>,
}

#[derive(Default)]
struct SinkInner {
    next_id: u64,
    subscribers: Vec<(u64, SnapshotCallback)>,
    version: u64,
    latest: Vec<BatchSnapshot>,
}

impl StateSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It is invoked once right away with the latest
    /// snapshot, then on every publish until the subscription is dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[BatchSnapshot]) + Send + Sync + 'static,
    {
        let callback: SnapshotCallback = Arc::new(callback);
        let _delivery = self.delivery.lock();
        let (id, latest) = {
            let mut inner = self.inner.write();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.push((id, Arc::clone(&callback)));
            (id, inner.latest.clone())
        };
        callback(&latest);

        Subscription {
            id,
            sink: Arc::downgrade(&self.inner),
        }
    }

    /// Record and fan out the snapshot taken at `version`.
    ///
    /// Returns `false` when a newer snapshot was already published. Callbacks
    /// run without the subscriber list locked.
    pub fn publish(&self, version: u64, snapshot: Vec<BatchSnapshot>) -> bool {
        let _delivery = self.delivery.lock();
        let callbacks: Vec<SnapshotCallback> = {
            let mut inner = self.inner.write();
            if version <= inner.version {
                return false;
            }
            inner.version = version;
            inner.latest = snapshot.clone();
            inner.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in callbacks {
            cb(&snapshot);
        }
        true
    }

    /// Last published snapshot.
    pub fn latest(&self) -> Vec<BatchSnapshot> {
        self.inner.read().latest.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.read().subscribers.len()
    }
}

/// Handle returned by [`StateSink::subscribe`]; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    sink: Weak<RwLock<SinkInner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.sink.upgrade() {
            inner.write().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}
