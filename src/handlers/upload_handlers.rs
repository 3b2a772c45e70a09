//! HTTP handlers for starting batches and watching their progress.

use crate::{
    errors::AppError,
    handlers::identity::request_identity,
    models::{
        asset::{AssetRef, SelectionSet},
        batch::{BatchId, BatchSnapshot, Visibility},
    },
    state::AppState,
};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::{
    broadcast::error::RecvError,
    mpsc::{self, error::TrySendError},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Events buffered per client before snapshots start being dropped.
const EVENT_BUFFER: usize = 64;

/// Body of `POST /uploads`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadReq {
    pub assets: Vec<AssetRef>,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadResp {
    pub batch_id: BatchId,
}

#[derive(Debug, Serialize)]
pub struct ActiveUploadsResp {
    pub uploading: bool,
    pub batches: Vec<BatchSnapshot>,
}

/// `POST /uploads`: queue the selected photos and return immediately.
pub async fn start_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartUploadReq>,
) -> Result<Response, AppError> {
    let mut selection = SelectionSet::try_from(req.assets)?;
    let identity = request_identity(&headers);

    let started = state.queue.start_upload(
        &identity,
        selection.take(),
        Visibility::from_public_flag(req.is_public),
    )?;

    Ok(match started {
        Some(batch_id) => (StatusCode::ACCEPTED, Json(StartUploadResp { batch_id })).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// `GET /uploads`: every batch still in flight.
pub async fn list_uploads(State(state): State<AppState>) -> Json<ActiveUploadsResp> {
    let batches = state.queue.list_active_batches();
    Json(ActiveUploadsResp {
        uploading: !batches.is_empty(),
        batches,
    })
}

/// `GET /uploads/events`: `snapshot` events on every change (the current
/// one first) and an `outcome` event when a batch settles.
///
/// A client that stops reading misses snapshots once its buffer is full;
/// outcomes wait for room instead.
pub async fn upload_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(EVENT_BUFFER);

    let snapshot_tx = tx.clone();
    let subscription = state.queue.subscribe(move |batches| {
        let event = match Event::default().event("snapshot").json_data(batches) {
            Ok(event) => event,
            Err(err) => {
                debug!("could not encode snapshot event: {err}");
                return;
            }
        };
        if let Err(TrySendError::Full(_)) = snapshot_tx.try_send(event) {
            debug!("event stream is full, dropped a snapshot");
        }
    });
    let mut outcomes = state.notifier.subscribe();
    let shutdown = state.shutdown.clone();

    tokio::spawn(async move {
        // Lives as long as the client is connected.
        let _subscription = subscription;
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = shutdown.cancelled() => break,
                received = outcomes.recv() => match received {
                    Ok(report) => {
                        let Ok(event) = Event::default().event("outcome").json_data(&report) else {
                            continue;
                        };
                        tokio::select! {
                            sent = tx.send(event) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                            _ = shutdown.cancelled() => break,
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event stream fell behind on outcomes");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("upload event stream closed");
    });

    let events = ReceiverStream::new(rx).map(Ok);
    Sse::new(events).keep_alive(KeepAlive::default())
}
