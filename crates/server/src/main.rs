//! FitChat hub server
//!
//! Development hub for the FitChat client.

use fitchat_hub::{AppState, HubConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fitchat_hub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HubConfig::from_env()?;
    let addr = config.addr;
    tracing::info!(
        "Serving hub at {} (transports: {:?})",
        config.hub_path,
        config.transports
    );
    let state = AppState::new(config);

    // Start server
    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    fitchat_hub::serve(listener, state).await?;
    Ok(())
}
