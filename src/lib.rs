//! Background photo upload queue.
//!
//! Callers hand [`UploadQueue::start_upload`] up to three local photos; each
//! becomes an [`UploadBatch`] whose files are pushed concurrently through a
//! resumable [`ObjectStore`] session. Progress is observable through
//! [`UploadQueue::subscribe`] and every batch produces exactly one
//! [`BatchReport`] once all of its files are done.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

pub use config::{AppConfig, QueueConfig};
pub use errors::{AppError, TransferError, UploadError};
pub use models::{
    asset::{AssetRef, MAX_SELECTION, SelectionSet},
    batch::{BatchId, BatchOutcome, BatchReport, BatchSnapshot, OwnerId, UploadBatch, Visibility},
    transfer::{ObjectKey, TransferStatus},
};
pub use services::{
    asset_resolver::{AssetResolver, FsAssetResolver, ResolvedAsset},
    notifier::{BroadcastNotifier, OutcomeNotifier},
    object_store::{LocalObjectStore, ObjectStore, StorageError},
    state_sink::{StateSink, Subscription},
    upload_queue::{IdentityProvider, StaticIdentity, UploadQueue},
};
pub use state::AppState;
