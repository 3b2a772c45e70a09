//! Core data models of the upload queue.
//!
//! Batches and transfers are in-memory only; objects, their metadata and
//! resumable sessions map to SQLite tables of the local object store via
//! `sqlx::FromRow`.

pub mod asset;
pub mod batch;
pub mod metadata;
pub mod object;
pub mod transfer;
pub mod upload_session;
