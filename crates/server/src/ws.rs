//! WebSocket transport.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fitchat_shared::TransportKind;
use futures_util::{SinkExt, StreamExt};

use crate::hub::Caller;
use crate::routes::ConnectionQuery;
use crate::state::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(
    state: AppState,
    query: ConnectionQuery,
    caller: Caller,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.hub.offers(TransportKind::WebSockets) {
        return (
            StatusCode::BAD_REQUEST,
            "WebSockets transport is disabled".to_string(),
        )
            .into_response();
    }
    if let Some(id) = query.id.as_deref() {
        if let Err(e) = state.hub.check_pending(id, &caller).await {
            tracing::warn!("WebSocket upgrade refused: {}", e);
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
    }

    tracing::info!("WebSocket connection authenticated for user: {}", caller.user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.id, caller))
}

/// Handle an authenticated WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    connection_id: Option<String>,
    caller: Caller,
) {
    let user_id = caller.user_id.clone();
    let (connection_id, mut outbox) = match state.hub.connect(connection_id.as_deref(), caller).await {
        Ok(opened) => opened,
        Err(e) => {
            tracing::warn!("WebSocket for {} not opened: {}", user_id, e);
            return;
        }
    };
    let (mut sender, mut receiver) = socket.split();

    // Task to forward frames to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(text) = outbox.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Main receive loop
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => state.hub.handle_text(&connection_id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!("WebSocket read error for {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    state.hub.disconnect(&connection_id).await;
    send_task.abort();
    tracing::info!("WebSocket connection closed for user: {}", user_id);
}
