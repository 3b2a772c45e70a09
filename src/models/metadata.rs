//! Custom key-value metadata attached to stored objects.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata key holding the owner's id.
pub const META_OWNER: &str = "uid";
/// Metadata key holding `"true"` or `"false"` for public listing.
pub const META_PUBLIC: &str = "public";

/// Key-value metadata entry attached to an object.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectMetadata {
    /// Reference to the associated object.
    pub object_id: Uuid,

    pub key: String,

    pub value: String,
}

/// Metadata supplied when an upload session is opened.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    pub content_type: Option<String>,
    pub custom: Vec<(String, String)>,
}
