use axum::{extract::State, Json};
use fitchat_shared::NegotiateResponse;

use crate::hub::Caller;
use crate::state::AppState;

/// `POST {hub}/negotiate`
pub async fn negotiate(State(state): State<AppState>, caller: Caller) -> Json<NegotiateResponse> {
    tracing::debug!("Negotiating connection for {}", caller.user_id);
    Json(state.hub.negotiate(caller).await)
}
