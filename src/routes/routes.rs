//! Defines the HTTP surface of the upload queue.
//!
//! ## Structure
//! - **Uploads**
//!   - `POST /uploads`: queue up to three photos (owner from `x-owner-id`)
//!   - `GET  /uploads`: active batch snapshots
//!   - `GET  /uploads/events`: Server-Sent Events: `snapshot` and `outcome`
//!
//! - **Objects**
//!   - `GET  /objects/{*key}`: download an uploaded photo
//!
//! The wildcard `*key` allows nested keys like `photos/user-1/1700000000000-0.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::get_object,
        upload_handlers::{list_uploads, start_upload, upload_events},
    },
    state::AppState,
};
use axum::{Router, routing::get};

/// Build the router. Handlers share [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/uploads", get(list_uploads).post(start_upload))
        .route("/uploads/events", get(upload_events))
        .route("/objects/{*key}", get(get_object))
}
