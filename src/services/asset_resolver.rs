//! Turns device asset references into uploadable bytes.

use crate::errors::TransferError;
use crate::models::asset::AssetRef;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};
use tokio::fs;

/// Payload of a resolved asset.
#[derive(Debug, Clone)]
pub struct ResolvedAsset {
    pub bytes: Bytes,
    pub content_type: String,
}

#[async_trait]
pub trait AssetResolver: Send + Sync {
    /// Read the asset. Missing or unreadable assets map to
    /// [`TransferError::AssetUnavailable`].
    async fn resolve(&self, asset: &AssetRef) -> Result<ResolvedAsset, TransferError>;
}

/// Resolves assets as paths on the local filesystem.
///
/// With a root configured, references are relative to it and may not
/// escape it; a `file://` scheme prefix is accepted and stripped.
#[derive(Debug, Clone, Default)]
pub struct FsAssetResolver {
    root: Option<PathBuf>,
}

impl FsAssetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn locate(&self, asset: &AssetRef) -> Result<PathBuf, TransferError> {
        let raw = asset.as_str();
        let raw = raw.strip_prefix("file://").unwrap_or(raw);
        if raw.is_empty() {
            return Err(TransferError::asset_unavailable(asset, "empty asset reference"));
        }
        let path = Path::new(raw);

        match &self.root {
            None => Ok(path.to_path_buf()),
            Some(root) => {
                let escapes = path
                    .components()
                    .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
                if escapes {
                    return Err(TransferError::asset_unavailable(
                        asset,
                        "path escapes the asset root",
                    ));
                }
                let relative = path.strip_prefix("/").unwrap_or(path);
                Ok(root.join(relative))
            }
        }
    }
}

#[async_trait]
impl AssetResolver for FsAssetResolver {
    async fn resolve(&self, asset: &AssetRef) -> Result<ResolvedAsset, TransferError> {
        let path = self.locate(asset)?;

        let meta = fs::metadata(&path).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => TransferError::asset_unavailable(asset, "file not found"),
            ErrorKind::PermissionDenied => {
                TransferError::asset_unavailable(asset, "permission denied")
            }
            _ => TransferError::asset_unavailable(asset, err.to_string()),
        })?;
        if !meta.is_file() {
            return Err(TransferError::asset_unavailable(asset, "not a regular file"));
        }

        let bytes = fs::read(&path)
            .await
            .map_err(|err| TransferError::asset_unavailable(asset, err.to_string()))?;

        Ok(ResolvedAsset {
            bytes: Bytes::from(bytes),
            content_type: guess_content_type(&path).to_string(),
        })
    }
}

/// Image MIME type from the file extension; JPEG when unknown.
pub fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("heic") => "image/heic",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}
