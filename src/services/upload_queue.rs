//! The aggregate root of background photo uploads.
//!
//! Owns the active batches, starts a coordinator per batch without blocking
//! the caller, and exposes the read side (snapshots and subscriptions) that
//! UI layers render from. One instance per process, passed around by clone.

use crate::config::QueueConfig;
use crate::errors::UploadError;
use crate::models::{
    asset::{AssetRef, MAX_SELECTION},
    batch::{BatchId, BatchReport, BatchSnapshot, OwnerId, Visibility},
    metadata::{META_OWNER, META_PUBLIC, UploadMetadata},
};
use crate::services::{
    asset_resolver::AssetResolver,
    coordinator::TransferCoordinator,
    executor::{TransferExecutor, TransferJob},
    notifier::OutcomeNotifier,
    object_store::ObjectStore,
    registry::BatchRegistry,
    state_sink::{StateSink, Subscription},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Source of the signed-in user's identity.
pub trait IdentityProvider: Send + Sync {
    fn current_owner(&self) -> Option<OwnerId>;
}

/// Fixed identity, or none for a signed-out caller.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(pub Option<OwnerId>);

impl StaticIdentity {
    pub fn signed_in(owner: impl Into<String>) -> Self {
        Self(Some(OwnerId::new(owner)))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_owner(&self) -> Option<OwnerId> {
        self.0.clone()
    }
}

#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    registry: BatchRegistry,
    executor: TransferExecutor,
    notifier: Arc<dyn OutcomeNotifier>,
    coordinators: Mutex<HashMap<BatchId, JoinHandle<Option<BatchReport>>>>,
}

impl UploadQueue {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        resolver: Arc<dyn AssetResolver>,
        notifier: Arc<dyn OutcomeNotifier>,
        config: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                registry: BatchRegistry::new(StateSink::new()),
                executor: TransferExecutor::new(store, resolver, config),
                notifier,
                coordinators: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a batch for `assets` and upload it in the background.
    ///
    /// Returns as soon as the batch is registered. An empty selection is a
    /// no-op (`Ok(None)`); a missing identity, an owner id that cannot be a
    /// key segment, or an oversized selection fails before anything is
    /// created. Must be called within a tokio runtime.
    pub fn start_upload(
        &self,
        identity: &dyn IdentityProvider,
        assets: Vec<AssetRef>,
        visibility: Visibility,
    ) -> Result<Option<BatchId>, UploadError> {
        if assets.is_empty() {
            return Ok(None);
        }
        let owner = identity
            .current_owner()
            .ok_or(UploadError::Unauthenticated)?;
        if !owner.is_key_segment() {
            return Err(UploadError::InvalidOwner(owner.to_string()));
        }
        if assets.len() > MAX_SELECTION {
            return Err(UploadError::SelectionLimitExceeded {
                limit: MAX_SELECTION,
            });
        }

        let batch = self
            .inner
            .registry
            .create(owner.clone(), visibility, assets);

        let metadata = UploadMetadata {
            content_type: None,
            custom: vec![
                (META_OWNER.to_string(), owner.to_string()),
                (META_PUBLIC.to_string(), visibility.is_public().to_string()),
            ],
        };
        let jobs = batch
            .transfers()
            .iter()
            .map(|t| TransferJob {
                index: t.index,
                asset: t.asset.clone(),
                key: t.key.clone(),
                metadata: metadata.clone(),
            })
            .collect();

        info!(
            batch = %batch.id,
            owner = %owner,
            files = batch.total_files(),
            ?visibility,
            "starting upload batch"
        );

        let coordinator = TransferCoordinator::new(
            batch.id,
            self.inner.registry.clone(),
            self.inner.executor.clone(),
            Arc::clone(&self.inner.notifier),
        );
        let mut coordinators = self.inner.coordinators.lock();
        coordinators.retain(|_, handle| !handle.is_finished());
        coordinators.insert(batch.id, coordinator.spawn(jobs));

        Ok(Some(batch.id))
    }

    /// Snapshot of every active batch, oldest first.
    pub fn list_active_batches(&self) -> Vec<BatchSnapshot> {
        self.inner.registry.snapshots()
    }

    /// Whether any batch is still in flight.
    pub fn is_uploading(&self) -> bool {
        !self.inner.registry.is_empty()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[BatchSnapshot]) + Send + Sync + 'static,
    {
        self.inner.registry.sink().subscribe(callback)
    }

    /// Await a batch's settlement.
    ///
    /// `None` for unknown batches, batches already awaited, and settled
    /// batches whose handle was reaped by a later `start_upload`.
    pub async fn wait_for(&self, id: BatchId) -> Option<BatchReport> {
        let handle = self.inner.coordinators.lock().remove(&id)?;
        match handle.await {
            Ok(report) => report,
            Err(err) => {
                warn!(batch = %id, "coordinator task failed: {err}");
                None
            }
        }
    }

    /// Await every outstanding batch.
    pub async fn shutdown(&self) -> Vec<BatchReport> {
        let handles: Vec<(BatchId, JoinHandle<Option<BatchReport>>)> =
            self.inner.coordinators.lock().drain().collect();
        let mut reports = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            match handle.await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(err) => warn!(batch = %id, "coordinator task failed: {err}"),
            }
        }
        reports.sort_by_key(|r| r.batch_id);
        reports
    }
}
