//! src/services/object_store.rs
//!
//! The destination of every transfer. `ObjectStore` is the resumable upload
//! protocol the executor speaks; `LocalObjectStore` implements it with SQLite
//! for metadata and sessions, and local disk for payloads sharded beneath
//! `base_path/{shard}/{shard}/{key}`.

use crate::models::{
    metadata::{ObjectMetadata, UploadMetadata},
    object::StoredObject,
    upload_session::UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");
const MAX_OBJECT_KEY_LEN: usize = 1024;
const STAGING_DIR: &str = ".uploads";
const HASH_BUF_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload session `{0}` not found")]
    SessionNotFound(String),
    #[error("chunk offset {got} does not match committed offset {expected}")]
    OffsetMismatch { expected: u64, got: u64 },
    #[error("chunk ending at {end} exceeds declared size {total}")]
    ChunkOverflow { end: u64, total: u64 },
    #[error("upload incomplete: {committed} of {total} bytes committed")]
    Incomplete { committed: u64, total: u64 },
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether resending from the committed offset may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::OffsetMismatch { .. } | Self::Unavailable(_) | Self::Io(_) => true,
            Self::Sqlx(err) => matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)),
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Resumable upload protocol.
///
/// A client opens a session, sends chunks strictly in order, and on any
/// interruption asks for the committed offset and resends from there.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a session for `total_bytes` bytes to be stored under `key`.
    async fn begin_upload(
        &self,
        key: &str,
        total_bytes: u64,
        metadata: &UploadMetadata,
    ) -> StorageResult<UploadSession>;

    /// Append `chunk` at `offset`; returns the new committed offset.
    async fn upload_chunk(&self, upload_id: &str, offset: u64, chunk: Bytes) -> StorageResult<u64>;

    /// Offset the next chunk must start at.
    async fn committed_offset(&self, upload_id: &str) -> StorageResult<u64>;

    /// Commit a fully transferred session as an object. The session is
    /// gone afterwards.
    async fn finish_upload(&self, upload_id: &str) -> StorageResult<StoredObject>;

    /// Discard a session that will never be finished, with whatever it
    /// staged so far.
    async fn abort_upload(&self, _upload_id: &str) -> StorageResult<()> {
        Ok(())
    }

    /// Publicly fetchable URL of a committed object.
    async fn download_url(&self, key: &str) -> StorageResult<String>;
}

/// Object store backed by SQLite metadata and sharded on-disk payloads.
#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// Prefix of download URLs, e.g. `http://localhost:3000`.
    pub public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            public_base_url: public_base_url.into(),
        }
    }

    /// Create tables if they do not exist yet.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Every `/`-separated component must be non-empty and neither `.` nor
    /// `..`; dots elsewhere in a component are fine.
    fn ensure_key_safe(key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Two-level shard identifiers: first two bytes of MD5(key) as hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn staging_path(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(STAGING_DIR).join(upload_id)
    }

    /// Remove a session's staged payload and its row. Missing pieces are
    /// not an error.
    async fn discard_session(&self, upload_id: &str) -> StorageResult<()> {
        match fs::remove_file(self.staging_path(upload_id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }
        sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Drop every session opened before `cutoff`, staged bytes included.
    ///
    /// Best effort: a session that cannot be removed is logged and skipped.
    /// Returns how many were removed.
    pub async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let sessions: Vec<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT upload_id, initiated_at FROM upload_sessions")
                .fetch_all(&*self.db)
                .await?;

        let mut removed = 0;
        for (upload_id, _) in sessions.into_iter().filter(|(_, at)| *at < cutoff) {
            match self.discard_session(&upload_id).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(upload_id, "could not remove stale upload session: {err}"),
            }
        }
        if removed > 0 {
            debug!(removed, "purged stale upload sessions");
        }
        Ok(removed)
    }

    async fn fetch_session(&self, upload_id: &str) -> StorageResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT upload_id, key, content_type, custom_metadata, total_bytes,
                    committed_bytes, initiated_at
             FROM upload_sessions WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::SessionNotFound(upload_id.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    async fn fetch_object(&self, key: &str) -> StorageResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(
            "SELECT id, key, content_type, size_bytes, etag, last_modified
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound(key.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Object metadata record plus its custom metadata entries.
    pub async fn get_object_metadata(
        &self,
        key: &str,
    ) -> StorageResult<(StoredObject, Vec<ObjectMetadata>)> {
        Self::ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;
        let metadata = sqlx::query_as::<_, ObjectMetadata>(
            "SELECT object_id, key, value FROM object_metadata
             WHERE object_id = ? ORDER BY key",
        )
        .bind(object.id)
        .fetch_all(&*self.db)
        .await?;
        Ok((object, metadata))
    }

    /// Returns metadata and an opened File handle ready for streaming out.
    /// Returns ObjectNotFound if metadata exists but physical file is missing.
    pub async fn get_object_reader(&self, key: &str) -> StorageResult<(StoredObject, File)> {
        Self::ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound(key.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;
        Ok((object, file))
    }

    /// MD5 of a staged payload, streamed in fixed-size reads.
    async fn digest_file(path: &Path) -> StorageResult<String> {
        let mut file = File::open(path).await?;
        let mut digest = Context::new();
        let mut buf = vec![0u8; HASH_BUF_LEN];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
        }
        Ok(format!("{:x}", digest.compute()))
    }

    /// Move a staged payload into its final sharded location.
    async fn promote(&self, staged: &Path, key: &str) -> StorageResult<PathBuf> {
        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        if let Err(err) = fs::rename(staged, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(staged, &file_path).await?;
            } else {
                return Err(StorageError::Io(err));
            }
        }
        Ok(file_path)
    }

    /// Upsert the object row, replace its metadata, and drop the session in
    /// one transaction.
    async fn record_object(
        &self,
        session: &UploadSession,
        etag: String,
        custom: &[(String, String)],
    ) -> StorageResult<StoredObject> {
        let mut tx = self.db.begin().await?;

        let object = sqlx::query_as::<_, StoredObject>(
            r#"
            INSERT INTO objects (id, key, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING id, key, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&session.key)
        .bind(session.content_type.clone())
        .bind(session.total_bytes)
        .bind(&etag)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object.id)
            .execute(&mut *tx)
            .await?;
        for (key, value) in custom {
            sqlx::query("INSERT INTO object_metadata (object_id, key, value) VALUES (?, ?, ?)")
                .bind(object.id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(&session.upload_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(object)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn begin_upload(
        &self,
        key: &str,
        total_bytes: u64,
        metadata: &UploadMetadata,
    ) -> StorageResult<UploadSession> {
        Self::ensure_key_safe(key)?;

        let session = UploadSession {
            upload_id: Uuid::new_v4().to_string(),
            key: key.to_string(),
            content_type: metadata.content_type.clone(),
            custom_metadata: serde_json::to_string(&metadata.custom)?,
            total_bytes: total_bytes as i64,
            committed_bytes: 0,
            initiated_at: Utc::now(),
        };

        let staged = self.staging_path(&session.upload_id);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent).await?;
        }
        File::create(&staged).await?;

        let inserted = sqlx::query(
            "INSERT INTO upload_sessions (
                upload_id, key, content_type, custom_metadata, total_bytes,
                committed_bytes, initiated_at
             ) VALUES (?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&session.upload_id)
        .bind(&session.key)
        .bind(session.content_type.clone())
        .bind(&session.custom_metadata)
        .bind(session.total_bytes)
        .bind(session.initiated_at)
        .execute(&*self.db)
        .await;

        if let Err(err) = inserted {
            let _ = fs::remove_file(&staged).await;
            return Err(StorageError::Sqlx(err));
        }

        debug!(upload_id = %session.upload_id, key, total_bytes, "opened upload session");
        Ok(session)
    }

    async fn upload_chunk(&self, upload_id: &str, offset: u64, chunk: Bytes) -> StorageResult<u64> {
        let session = self.fetch_session(upload_id).await?;
        let committed = session.committed_bytes as u64;
        if offset != committed {
            return Err(StorageError::OffsetMismatch {
                expected: committed,
                got: offset,
            });
        }
        let total = session.total_bytes as u64;
        let end = offset + chunk.len() as u64;
        if end > total {
            return Err(StorageError::ChunkOverflow { end, total });
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.staging_path(upload_id))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&chunk).await?;
        file.flush().await?;

        let result = sqlx::query(
            "UPDATE upload_sessions SET committed_bytes = ?
             WHERE upload_id = ? AND committed_bytes = ?",
        )
        .bind(end as i64)
        .bind(upload_id)
        .bind(offset as i64)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.fetch_session(upload_id).await?;
            return Err(StorageError::OffsetMismatch {
                expected: current.committed_bytes as u64,
                got: offset,
            });
        }

        Ok(end)
    }

    async fn committed_offset(&self, upload_id: &str) -> StorageResult<u64> {
        let session = self.fetch_session(upload_id).await?;
        Ok(session.committed_bytes as u64)
    }

    async fn finish_upload(&self, upload_id: &str) -> StorageResult<StoredObject> {
        let session = self.fetch_session(upload_id).await?;
        if session.committed_bytes != session.total_bytes {
            return Err(StorageError::Incomplete {
                committed: session.committed_bytes as u64,
                total: session.total_bytes as u64,
            });
        }

        let staged = self.staging_path(upload_id);
        File::open(&staged).await?.sync_all().await?;
        let etag = Self::digest_file(&staged).await?;
        let custom: Vec<(String, String)> = serde_json::from_str(&session.custom_metadata)?;

        let file_path = self.promote(&staged, &session.key).await?;

        match self.record_object(&session, etag, &custom).await {
            Ok(object) => {
                debug!(key = %object.key, size = object.size_bytes, "committed object");
                Ok(object)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(err)
            }
        }
    }

    async fn abort_upload(&self, upload_id: &str) -> StorageResult<()> {
        self.discard_session(upload_id).await?;
        debug!(upload_id, "aborted upload session");
        Ok(())
    }

    async fn download_url(&self, key: &str) -> StorageResult<String> {
        Self::ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;
        Ok(format!(
            "{}/objects/{}",
            self.public_base_url.trim_end_matches('/'),
            object.key
        ))
    }
}
