//! Represents an upload batch: the unit of progress reporting for a user's
//! selection of photos.

use crate::errors::TransferError;
use crate::models::{
    asset::AssetRef,
    transfer::{AssetTransfer, ObjectKey, TransferState, TransferStatus},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of the signed-in user that owns uploaded photos.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can stand as one segment of an object key.
    pub fn is_key_segment(&self) -> bool {
        let id = self.0.as_str();
        !id.is_empty()
            && id != "."
            && id != ".."
            && !id
                .bytes()
                .any(|b| b == b'/' || b == b'\\' || b.is_ascii_control())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether uploaded photos should be listed publicly.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn from_public_flag(is_public: bool) -> Self {
        if is_public { Self::Public } else { Self::Private }
    }

    pub fn is_public(self) -> bool {
        matches!(self, Self::Public)
    }
}

/// Batch identity, issued from the creation time in epoch milliseconds.
///
/// Ids are strictly increasing within a process so they double as the
/// timestamp component of every key in the batch.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct BatchId(i64);

impl BatchId {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate result of a settled batch. Deliberately binary.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchOutcome {
    Succeeded,
    Failed,
}

/// An in-flight group of up to three photo uploads.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub id: BatchId,
    pub owner: OwnerId,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    transfers: Vec<AssetTransfer>,
}

impl UploadBatch {
    /// Create a batch with one pending transfer per asset, keyed by the
    /// batch's timestamp and the asset's position.
    pub fn new(id: BatchId, owner: OwnerId, visibility: Visibility, assets: Vec<AssetRef>) -> Self {
        let transfers = assets
            .into_iter()
            .enumerate()
            .map(|(index, asset)| {
                let key = ObjectKey::for_photo(&owner, id.as_millis(), index);
                AssetTransfer::new(index, asset, key)
            })
            .collect();

        Self {
            id,
            owner,
            visibility,
            created_at: Utc::now(),
            transfers,
        }
    }

    pub fn transfers(&self) -> &[AssetTransfer] {
        &self.transfers
    }

    pub fn total_files(&self) -> usize {
        self.transfers.len()
    }

    pub fn completed_files(&self) -> usize {
        self.count(TransferStatus::Succeeded)
    }

    pub fn failed_files(&self) -> usize {
        self.count(TransferStatus::Failed)
    }

    fn count(&self, status: TransferStatus) -> usize {
        self.transfers
            .iter()
            .filter(|t| t.state().status() == status)
            .count()
    }

    /// Aggregate progress: the sum of every file's fractional completion
    /// over the file count.
    pub fn progress(&self) -> f64 {
        if self.transfers.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.transfers.iter().map(AssetTransfer::progress).sum();
        (sum / self.transfers.len() as f64).clamp(0.0, 100.0)
    }

    /// Every transfer has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        !self.transfers.is_empty() && self.transfers.iter().all(|t| t.state().is_terminal())
    }

    pub fn outcome(&self) -> Option<BatchOutcome> {
        if !self.is_settled() {
            return None;
        }
        if self.failed_files() == 0 {
            Some(BatchOutcome::Succeeded)
        } else {
            Some(BatchOutcome::Failed)
        }
    }

    /// Mutable access for the coordinator; `None` for unknown indexes.
    pub(crate) fn transfer_mut(&mut self, index: usize) -> Option<&mut AssetTransfer> {
        self.transfers.get_mut(index)
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            id: self.id,
            progress: self.progress(),
            total_files: self.total_files(),
            completed_files: self.completed_files(),
            failed_files: self.failed_files(),
            outcome: self.outcome(),
            files: self
                .transfers
                .iter()
                .map(|t| FileSnapshot {
                    index: t.index,
                    asset: t.asset.clone(),
                    key: t.key.clone(),
                    progress: t.progress(),
                    status: t.state().status(),
                    url: match t.state() {
                        TransferState::Succeeded { url } => Some(url.clone()),
                        _ => None,
                    },
                    error: match t.state() {
                        TransferState::Failed { error } => Some(error.clone()),
                        _ => None,
                    },
                })
                .collect(),
        }
    }

    /// Final accounting, available once the batch has settled.
    pub fn report(&self) -> Option<BatchReport> {
        let outcome = self.outcome()?;
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for t in &self.transfers {
            match t.state() {
                TransferState::Succeeded { url } => succeeded.push(UploadedFile {
                    index: t.index,
                    key: t.key.clone(),
                    url: url.clone(),
                }),
                TransferState::Failed { error } => failed.push(FailedFile {
                    index: t.index,
                    asset: t.asset.clone(),
                    error: error.clone(),
                }),
                _ => {}
            }
        }
        Some(BatchReport {
            batch_id: self.id,
            outcome,
            total_files: self.total_files(),
            succeeded,
            failed,
        })
    }
}

/// Read-only view of an active batch handed to subscribers.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub id: BatchId,
    pub progress: f64,
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub outcome: Option<BatchOutcome>,
    pub files: Vec<FileSnapshot>,
}

impl BatchSnapshot {
    /// Banner text, e.g. `1 of 3 photos • 47%`.
    pub fn summary(&self) -> String {
        format!(
            "{} of {} photos • {}%",
            self.completed_files,
            self.total_files,
            self.progress.round() as u32
        )
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileSnapshot {
    pub index: usize,
    pub asset: AssetRef,
    pub key: ObjectKey,
    pub progress: f64,
    pub status: TransferStatus,
    pub url: Option<String>,
    pub error: Option<TransferError>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub index: usize,
    pub key: ObjectKey,
    pub url: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedFile {
    pub index: usize,
    pub asset: AssetRef,
    pub error: TransferError,
}

/// Settlement summary delivered once per batch.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub outcome: BatchOutcome,
    pub total_files: usize,
    pub succeeded: Vec<UploadedFile>,
    pub failed: Vec<FailedFile>,
}

impl BatchReport {
    /// One-line user-facing alert text.
    pub fn message(&self) -> String {
        match self.outcome {
            BatchOutcome::Succeeded => {
                format!("Successfully uploaded {} image(s)", self.total_files)
            }
            BatchOutcome::Failed => "There was an error uploading your photos. \
                 Please check your connection and try again."
                .to_string(),
        }
    }
}
