//! Represents a photo object committed to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata row of a stored object. Payload bytes live on disk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Object key, e.g. `photos/<owner>/<millis>-<index>.jpg`.
    pub key: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the payload, hex-encoded.
    pub etag: String,

    /// Timestamp when the upload was committed.
    pub last_modified: DateTime<Utc>,
}
