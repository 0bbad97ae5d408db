//! FitChat development hub.
//!
//! An Axum server that speaks the hub protocol over WebSockets and long
//! polling, enough to run the client against a real socket.

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod config;
pub mod hub;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::HubConfig;
pub use hub::{Caller, Hub, HubError};
pub use state::{AppState, PollSession};

/// Build the hub router.
pub fn router(state: AppState) -> Router {
    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let hub_path = state.config.hub_path.clone();
    let negotiate_path = state.config.negotiate_path();

    Router::new()
        .route(&negotiate_path, post(routes::negotiate::negotiate))
        .route(
            &hub_path,
            get(routes::connect)
                .post(routes::long_polling::send)
                .delete(routes::long_polling::close),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the hub on an already bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let reaper = state.spawn_reaper();
    let app = router(state);
    let result = axum::serve(listener, app).await;
    reaper.abort();
    result
}
