//! Client configuration, built in code or from environment variables.

use std::time::Duration;

use fitchat_shared::TransportKind;
use url::Url;

use crate::error::TransportError;

const DEFAULT_KEEP_ALIVE_MS: u64 = 15_000;
const DEFAULT_SERVER_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_LONG_POLL_TIMEOUT_MS: u64 = 90_000;

/// Settings fixed for the lifetime of one chat service.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// Hub endpoint, e.g. `https://api.example.com/hubs/chat`.
    pub hub_url: Url,
    /// Transports to try, most capable first.
    pub transports: Vec<TransportKind>,
    /// Connect straight over WebSockets without the negotiate round trip.
    pub skip_negotiation: bool,
    pub keep_alive_interval: Duration,
    /// Silence longer than this is treated as a dropped connection.
    pub server_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Upper bound for one long-poll request.
    pub long_poll_timeout: Duration,
}

impl ChatConfig {
    pub fn new(hub_url: Url) -> Self {
        Self {
            hub_url,
            transports: vec![TransportKind::WebSockets, TransportKind::LongPolling],
            skip_negotiation: false,
            keep_alive_interval: Duration::from_millis(DEFAULT_KEEP_ALIVE_MS),
            server_timeout: Duration::from_millis(DEFAULT_SERVER_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            long_poll_timeout: Duration::from_millis(DEFAULT_LONG_POLL_TIMEOUT_MS),
        }
    }

    /// Parse `hub_url` and apply defaults.
    pub fn parse(hub_url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(hub_url).map_err(|e| TransportError::InvalidUrl {
            url: hub_url.to_string(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(Self::new(url)),
            other => Err(TransportError::InvalidUrl {
                url: hub_url.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            }),
        }
    }

    /// Build a config from environment variables.
    ///
    /// Environment variables:
    /// - `FITCHAT_HUB_URL`: hub endpoint (required)
    /// - `FITCHAT_TRANSPORTS`: comma list, e.g. "websockets,longpolling"
    /// - `FITCHAT_SKIP_NEGOTIATION`: "true" | "1" to connect directly
    /// - `FITCHAT_KEEP_ALIVE_MS`, `FITCHAT_SERVER_TIMEOUT_MS`,
    ///   `FITCHAT_HANDSHAKE_TIMEOUT_MS`: timings in milliseconds
    pub fn from_env() -> Result<Self, TransportError> {
        let hub_url =
            std::env::var("FITCHAT_HUB_URL").map_err(|_| TransportError::InvalidUrl {
                url: String::new(),
                reason: "FITCHAT_HUB_URL is not set".to_string(),
            })?;
        let mut config = Self::parse(&hub_url)?;

        if let Ok(list) = std::env::var("FITCHAT_TRANSPORTS") {
            let transports: Vec<_> = list.split(',').filter_map(TransportKind::parse).collect();
            if transports.is_empty() {
                crate::log_warn!("FITCHAT_TRANSPORTS '{}' names no known transport, keeping defaults", list);
            } else {
                config.transports = transports;
            }
        }
        if let Ok(flag) = std::env::var("FITCHAT_SKIP_NEGOTIATION") {
            config.skip_negotiation = matches!(flag.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(ms) = env_millis("FITCHAT_KEEP_ALIVE_MS") {
            config.keep_alive_interval = ms;
        }
        if let Some(ms) = env_millis("FITCHAT_SERVER_TIMEOUT_MS") {
            config.server_timeout = ms;
        }
        if let Some(ms) = env_millis("FITCHAT_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = ms;
        }

        Ok(config)
    }

    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            crate::log_warn!("ignoring {}='{}': not a millisecond count", key, raw);
            None
        }
    }
}
