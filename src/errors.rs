use crate::models::{asset::AssetRef, transfer::ObjectKey};
use crate::services::object_store::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Errors raised synchronously when a batch is requested.
///
/// When any of these is returned no batch exists and no state has changed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("you must be logged in to upload photos")]
    Unauthenticated,
    #[error("owner id `{0}` cannot be used in an object key")]
    InvalidOwner(String),
    #[error("at most {limit} photos can be selected")]
    SelectionLimitExceeded { limit: usize },
}

/// Terminal error of a single transfer. Kept per file, never thrown across
/// the batch boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TransferError {
    #[error("asset `{asset}` is unavailable: {reason}")]
    AssetUnavailable { asset: String, reason: String },
    #[error("upload of `{key}` failed: {reason}")]
    TransferFailed { key: String, reason: String },
}

impl TransferError {
    pub fn asset_unavailable(asset: &AssetRef, reason: impl Into<String>) -> Self {
        Self::AssetUnavailable {
            asset: asset.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transfer_failed(key: &ObjectKey, reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match err {
            UploadError::Unauthenticated => StatusCode::UNAUTHORIZED,
            UploadError::InvalidOwner(_) => StatusCode::BAD_REQUEST,
            UploadError::SelectionLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ObjectNotFound(_) | StorageError::SessionNotFound(_) => {
                AppError::not_found(err.to_string())
            }
            StorageError::InvalidObjectKey => AppError::new(StatusCode::BAD_REQUEST, err.to_string()),
            other => AppError::internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
