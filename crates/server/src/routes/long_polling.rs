//! Long-polling transport.
//!
//! The first `GET` for a negotiated id opens the connection and returns an
//! empty batch. Later polls wait up to the configured timeout for frames.
//! Sessions left unpolled past `stale_after` are reaped.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fitchat_shared::TransportKind;
use tokio::sync::mpsc::error::TryRecvError;

use super::ConnectionQuery;
use crate::hub::Caller;
use crate::state::{AppState, PollSession};

/// `GET {hub}?id=…`
pub async fn poll(state: AppState, query: ConnectionQuery, caller: Caller) -> Response {
    if !state.hub.offers(TransportKind::LongPolling) {
        return (
            StatusCode::BAD_REQUEST,
            "LongPolling transport is disabled".to_string(),
        )
            .into_response();
    }
    let Some(id) = query.id else {
        return (StatusCode::BAD_REQUEST, "Missing connection id".to_string()).into_response();
    };

    let session = state.long_polls.read().await.get(&id).cloned();
    let Some(session) = session else {
        return open(&state, id, caller).await;
    };
    if let Err(status) = ensure_owner(&state, &id, &caller).await {
        return status.into_response();
    }

    let mut outbox = session.lock().await;
    session.touch();
    let first = match tokio::time::timeout(state.config.long_poll_timeout, outbox.recv()).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            drop(outbox);
            state.long_polls.write().await.remove(&id);
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(_) => return Json(Vec::<String>::new()).into_response(),
    };

    let mut frames = vec![first];
    loop {
        match outbox.try_recv() {
            Ok(frame) => frames.push(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    Json(frames).into_response()
}

async fn open(state: &AppState, id: String, caller: Caller) -> Response {
    match state.hub.connect(Some(&id), caller).await {
        Ok((id, outbox)) => {
            state
                .long_polls
                .write()
                .await
                .insert(id, Arc::new(PollSession::new(outbox)));
            Json(Vec::<String>::new()).into_response()
        }
        Err(e) => {
            tracing::warn!("Long poll refused: {}", e);
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
    }
}

/// `POST {hub}?id=…`
pub async fn send(
    State(state): State<AppState>,
    Query(query): Query<ConnectionQuery>,
    caller: Caller,
    body: String,
) -> StatusCode {
    let Some(id) = query.id else {
        return StatusCode::BAD_REQUEST;
    };
    if let Err(status) = ensure_owner(&state, &id, &caller).await {
        return status;
    }
    if let Some(session) = state.long_polls.read().await.get(&id) {
        session.touch();
    }
    state.hub.handle_text(&id, &body).await;
    StatusCode::OK
}

/// `DELETE {hub}?id=…`
pub async fn close(
    State(state): State<AppState>,
    Query(query): Query<ConnectionQuery>,
    caller: Caller,
) -> StatusCode {
    let Some(id) = query.id else {
        return StatusCode::BAD_REQUEST;
    };
    if let Err(status) = ensure_owner(&state, &id, &caller).await {
        return status;
    }
    state.hub.disconnect(&id).await;
    state.long_polls.write().await.remove(&id);
    tracing::info!("Long polling connection {} closed by {}", id, caller.user_id);
    StatusCode::OK
}

async fn ensure_owner(state: &AppState, id: &str, caller: &Caller) -> Result<(), StatusCode> {
    match state.hub.caller(id).await {
        Some(owner) if owner.user_id == caller.user_id => Ok(()),
        Some(_) => Err(StatusCode::FORBIDDEN),
        None => Err(StatusCode::NOT_FOUND),
    }
}
