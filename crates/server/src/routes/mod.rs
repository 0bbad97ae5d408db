//! HTTP route handlers.

pub mod long_polling;
pub mod negotiate;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::hub::Caller;
use crate::state::AppState;

/// `?id=` carried by every transport request after negotiation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionQuery {
    #[serde(default)]
    pub id: Option<String>,
}

/// `GET {hub}`: WebSocket upgrade when requested, long poll otherwise.
pub async fn connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectionQuery>,
    caller: Caller,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => crate::ws::ws_handler(state, query, caller, ws).await,
        Err(_) => long_polling::poll(state, query, caller).await,
    }
}
