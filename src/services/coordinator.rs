//! Per-batch fan-out: one executor task per asset, one writer for the batch
//! record, and settlement once every transfer is terminal.

use crate::errors::TransferError;
use crate::models::batch::{BatchId, BatchReport};
use crate::services::{
    executor::{TransferEvent, TransferExecutor, TransferJob},
    notifier::OutcomeNotifier,
    registry::BatchRegistry,
};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle, task::JoinSet};
use tracing::{debug, info, warn};

pub(crate) struct TransferCoordinator {
    batch_id: BatchId,
    registry: BatchRegistry,
    executor: TransferExecutor,
    notifier: Arc<dyn OutcomeNotifier>,
}

impl TransferCoordinator {
    pub(crate) fn new(
        batch_id: BatchId,
        registry: BatchRegistry,
        executor: TransferExecutor,
        notifier: Arc<dyn OutcomeNotifier>,
    ) -> Self {
        Self {
            batch_id,
            registry,
            executor,
            notifier,
        }
    }

    /// Start the batch in the background. The handle resolves to the
    /// settlement report.
    pub(crate) fn spawn(self, jobs: Vec<TransferJob>) -> JoinHandle<Option<BatchReport>> {
        tokio::spawn(self.run(jobs))
    }

    async fn run(self, jobs: Vec<TransferJob>) -> Option<BatchReport> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Dropping the set (e.g. if this task is aborted) aborts every executor.
        let mut executors = JoinSet::new();
        for job in jobs {
            let executor = self.executor.clone();
            let tx = tx.clone();
            executors.spawn(async move { executor.execute(job, tx).await });
        }
        drop(tx);

        let mut settled = false;
        while let Some(event) = rx.recv().await {
            self.apply(event);
            settled = self
                .registry
                .get(self.batch_id)
                .is_none_or(|batch| batch.is_settled());
            if settled {
                break;
            }
        }

        if !settled {
            // Every sender is gone but some transfer never reported.
            self.fail_unreported();
        }

        while let Some(joined) = executors.join_next().await {
            if let Err(err) = joined {
                warn!(batch = %self.batch_id, "executor task ended abnormally: {err}");
            }
        }

        self.settle()
    }

    fn apply(&self, event: TransferEvent) {
        let id = self.batch_id;
        let changed = self.registry.update(id, |batch| match event {
            TransferEvent::Phase { index, state } => batch
                .transfer_mut(index)
                .is_some_and(|t| t.advance(state)),
            TransferEvent::Progress { index, percent } => batch
                .transfer_mut(index)
                .is_some_and(|t| t.record_progress(percent)),
            TransferEvent::Finished { index, result } => {
                batch.transfer_mut(index).is_some_and(|t| match result {
                    Ok(url) => t.succeed(url),
                    Err(err) => t.fail(err),
                })
            }
        });
        if changed == Some(false) {
            debug!(batch = %id, "ignored stale transfer event");
        }
    }

    fn fail_unreported(&self) {
        self.registry.update(self.batch_id, |batch| {
            let mut changed = false;
            for index in 0..batch.total_files() {
                let Some(t) = batch.transfer_mut(index) else {
                    continue;
                };
                if !t.state().is_terminal() {
                    let err =
                        TransferError::transfer_failed(&t.key, "executor stopped before reporting");
                    warn!(batch = %self.batch_id, key = %t.key, "transfer never reported back");
                    changed |= t.fail(err);
                }
            }
            changed
        });
    }

    /// Alert once, then drop the batch from the active set.
    fn settle(&self) -> Option<BatchReport> {
        let report = self.registry.get(self.batch_id)?.report()?;
        self.notifier.notify(&report);
        self.registry.remove(self.batch_id);
        info!(
            batch = %self.batch_id,
            outcome = ?report.outcome,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "batch settled"
        );
        Some(report)
    }
}
