use crate::services::{
    notifier::BroadcastNotifier, object_store::LocalObjectStore, upload_queue::UploadQueue,
};
use tokio_util::sync::CancellationToken;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub queue: UploadQueue,
    pub store: LocalObjectStore,
    pub notifier: BroadcastNotifier,
    /// Cancelled when the server starts shutting down; ends open event streams.
    pub shutdown: CancellationToken,
}
