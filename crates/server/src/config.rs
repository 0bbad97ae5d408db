//! Hub configuration from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use fitchat_shared::TransportKind;

/// Settings for one hub process.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub addr: SocketAddr,
    /// Mount path of the chat hub, e.g. `/hubs/chat`.
    pub hub_path: String,
    /// How long a long-poll request waits for frames.
    pub long_poll_timeout: Duration,
    /// Interval of hub-to-client pings.
    pub keep_alive_interval: Duration,
    /// Transports advertised by negotiate.
    pub transports: Vec<TransportKind>,
    /// Unopened negotiations and unpolled long-poll sessions older than this
    /// are dropped.
    pub stale_after: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            hub_path: "/hubs/chat".to_string(),
            long_poll_timeout: Duration::from_millis(20_000),
            keep_alive_interval: Duration::from_millis(15_000),
            transports: vec![TransportKind::WebSockets, TransportKind::LongPolling],
            stale_after: Duration::from_millis(60_000),
        }
    }
}

impl HubConfig {
    /// Parse the hub config from environment variables.
    ///
    /// Environment variables:
    /// - `FITCHAT_HUB_ADDR`: listen address (default: "0.0.0.0:8080")
    /// - `FITCHAT_HUB_PATH`: hub mount path (default: "/hubs/chat")
    /// - `FITCHAT_LONG_POLL_TIMEOUT_MS`: long-poll wait (default: 20000)
    /// - `FITCHAT_HUB_KEEP_ALIVE_MS`: ping interval (default: 15000)
    /// - `FITCHAT_TRANSPORTS`: advertised transports (default: "websockets,longpolling")
    /// - `FITCHAT_HUB_STALE_MS`: reaping age for idle entries (default: 60000)
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("FITCHAT_HUB_ADDR") {
            config.addr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid FITCHAT_HUB_ADDR '{addr}': {e}"))?;
        }
        if let Ok(path) = std::env::var("FITCHAT_HUB_PATH") {
            let path = path.trim().trim_end_matches('/');
            if !path.starts_with('/') {
                anyhow::bail!("FITCHAT_HUB_PATH must start with '/', got '{path}'");
            }
            config.hub_path = path.to_string();
        }
        if let Ok(ms) = std::env::var("FITCHAT_LONG_POLL_TIMEOUT_MS") {
            config.long_poll_timeout = Duration::from_millis(ms.trim().parse()?);
        }
        if let Ok(ms) = std::env::var("FITCHAT_HUB_KEEP_ALIVE_MS") {
            config.keep_alive_interval = Duration::from_millis(ms.trim().parse()?);
        }
        if let Ok(ms) = std::env::var("FITCHAT_HUB_STALE_MS") {
            config.stale_after = Duration::from_millis(ms.trim().parse()?);
        }
        if let Ok(list) = std::env::var("FITCHAT_TRANSPORTS") {
            let transports: Vec<_> = list.split(',').filter_map(TransportKind::parse).collect();
            if transports.is_empty() {
                anyhow::bail!("FITCHAT_TRANSPORTS '{list}' names no known transport");
            }
            config.transports = transports;
        }

        Ok(config)
    }

    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = age;
        self
    }

    pub fn negotiate_path(&self) -> String {
        format!("{}/negotiate", self.hub_path)
    }
}
