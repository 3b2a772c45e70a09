//! One-shot, user-facing outcome of a settled batch.

use crate::models::batch::{BatchOutcome, BatchReport};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub trait OutcomeNotifier: Send + Sync {
    /// Called exactly once per batch, after settlement and before removal.
    fn notify(&self, report: &BatchReport);
}

/// Logs every report and forwards it to any live receivers.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<BatchReport>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchReport> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl OutcomeNotifier for BroadcastNotifier {
    fn notify(&self, report: &BatchReport) {
        match report.outcome {
            BatchOutcome::Succeeded => info!(
                batch = %report.batch_id,
                files = report.total_files,
                "{}",
                report.message()
            ),
            BatchOutcome::Failed => warn!(
                batch = %report.batch_id,
                failed = report.failed.len(),
                succeeded = report.succeeded.len(),
                "{}",
                report.message()
            ),
        }
        // No receivers is fine; the log line is the alert of record.
        let _ = self.tx.send(report.clone());
    }
}
