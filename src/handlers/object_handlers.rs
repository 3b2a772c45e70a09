//! HTTP handler serving uploaded photos.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `LocalObjectStore`.

use crate::{
    errors::AppError,
    handlers::identity::request_owner,
    models::{
        metadata::{META_OWNER, META_PUBLIC, ObjectMetadata},
        object::StoredObject,
    },
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

/// Download `/objects/{*key}` as a streaming response.
///
/// Private photos are only visible to their owner; anyone else gets the same
/// 404 as for a missing key.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (_, metadata) = state.store.get_object_metadata(&key).await?;
    if !may_read(&metadata, request_owner(&headers).as_ref().map(|o| o.as_str())) {
        return Err(AppError::not_found(format!("object `{}` not found", key)));
    }

    let (meta, file) = state.store.get_object_reader(&key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn may_read(metadata: &[ObjectMetadata], requester: Option<&str>) -> bool {
    let value = |name: &str| {
        metadata
            .iter()
            .find(|m| m.key == name)
            .map(|m| m.value.as_str())
    };
    if value(META_PUBLIC) == Some("true") {
        return true;
    }
    matches!((value(META_OWNER), requester), (Some(owner), Some(req)) if owner == req)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0)));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
