//! Represents resumable upload sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Server-side state of a resumable upload.
///
/// Chunks are accepted strictly in order; `committed_bytes` is the offset the
/// next chunk must start at and is where an interrupted client resumes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Unique upload ID (returned to client).
    pub upload_id: String,

    /// Object key being uploaded.
    pub key: String,

    pub content_type: Option<String>,

    /// JSON-encoded custom metadata applied to the object on completion.
    pub custom_metadata: String,

    pub total_bytes: i64,

    pub committed_bytes: i64,

    /// Timestamp when upload was initiated.
    pub initiated_at: DateTime<Utc>,
}
