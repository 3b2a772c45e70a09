//! Per-file transfer state within a batch.

use crate::errors::TransferError;
use crate::models::asset::AssetRef;
use crate::models::batch::OwnerId;
use serde::Serialize;
use std::fmt;

/// Top-level folder every uploaded photo lives under.
pub const KEY_PREFIX: &str = "photos";

/// Object-store key of an uploaded photo:
/// `photos/<ownerId>/<epochMillis>-<ordinalIndex>.jpg`.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn for_photo(owner: &OwnerId, epoch_millis: i64, index: usize) -> Self {
        Self(format!(
            "{}/{}/{}-{}.jpg",
            KEY_PREFIX,
            owner.as_str(),
            epoch_millis,
            index
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a single transfer.
///
/// `Pending -> Resolving -> Uploading -> {Succeeded | Failed}`; terminal
/// states are never left.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    Pending,
    Resolving,
    Uploading,
    Succeeded { url: String },
    Failed { error: TransferError },
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Resolving => 1,
            Self::Uploading => 2,
            Self::Succeeded { .. } | Self::Failed { .. } => 3,
        }
    }

    pub fn status(&self) -> TransferStatus {
        match self {
            Self::Pending => TransferStatus::Pending,
            Self::Resolving => TransferStatus::Resolving,
            Self::Uploading => TransferStatus::Uploading,
            Self::Succeeded { .. } => TransferStatus::Succeeded,
            Self::Failed { .. } => TransferStatus::Failed,
        }
    }
}

/// Data-free view of [`TransferState`] for snapshots.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Resolving,
    Uploading,
    Succeeded,
    Failed,
}

/// One file of an [`UploadBatch`](crate::models::batch::UploadBatch).
#[derive(Debug, Clone)]
pub struct AssetTransfer {
    pub index: usize,
    pub asset: AssetRef,
    pub key: ObjectKey,
    progress: f64,
    state: TransferState,
}

impl AssetTransfer {
    pub fn new(index: usize, asset: AssetRef, key: ObjectKey) -> Self {
        Self {
            index,
            asset,
            key,
            progress: 0.0,
            state: TransferState::Pending,
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Advance to a non-terminal phase. Backwards moves are ignored.
    pub(crate) fn advance(&mut self, next: TransferState) -> bool {
        debug_assert!(!next.is_terminal());
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            return false;
        }
        self.state = next;
        true
    }

    /// Record byte progress in percent. Never decreases while in flight.
    pub(crate) fn record_progress(&mut self, percent: f64) -> bool {
        if self.state.is_terminal() || !percent.is_finite() {
            return false;
        }
        let clamped = percent.clamp(0.0, 100.0);
        if clamped <= self.progress {
            return false;
        }
        self.progress = clamped;
        true
    }

    pub(crate) fn succeed(&mut self, url: String) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.progress = 100.0;
        self.state = TransferState::Succeeded { url };
        true
    }

    pub(crate) fn fail(&mut self, error: TransferError) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TransferState::Failed { error };
        true
    }
}
