//! Caller identity for HTTP requests, taken from the `x-owner-id` header.

use crate::{models::batch::OwnerId, services::upload_queue::StaticIdentity};
use axum::http::HeaderMap;

pub const OWNER_HEADER: &str = "x-owner-id";

/// Owner named by the request, if any. Blank values count as signed out.
pub fn request_owner(headers: &HeaderMap) -> Option<OwnerId> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(OwnerId::new)
}

pub fn request_identity(headers: &HeaderMap) -> StaticIdentity {
    StaticIdentity(request_owner(headers))
}
