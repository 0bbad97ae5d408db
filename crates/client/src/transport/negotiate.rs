//! Negotiation and ordered transport fallback.

use std::time::Duration;

use async_trait::async_trait;
use fitchat_shared::{NegotiateResponse, TransportKind};
use reqwest::Client;
use url::Url;

use super::{http_url, long_polling, websocket, with_connection_id, ws_url, Connector, TransportChannel};
use crate::config::ChatConfig;
use crate::error::TransportError;

/// Production [`Connector`]: negotiates with the hub, then tries the
/// configured transports in order until one opens.
#[derive(Debug, Clone)]
pub struct HubConnector {
    http: Client,
    transports: Vec<TransportKind>,
    skip_negotiation: bool,
    long_poll_timeout: Duration,
}

impl HubConnector {
    pub fn new(config: &ChatConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(http: Client, config: &ChatConfig) -> Self {
        Self {
            http,
            transports: config.transports.clone(),
            skip_negotiation: config.skip_negotiation,
            long_poll_timeout: config.long_poll_timeout,
        }
    }

    /// `POST {hub}/negotiate`.
    pub async fn negotiate(
        &self,
        hub_url: &Url,
        access_token: &str,
    ) -> Result<NegotiateResponse, TransportError> {
        let mut url = http_url(hub_url)?;
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl {
                url: hub_url.to_string(),
                reason: "hub url cannot have a path".to_string(),
            })?
            .pop_if_empty()
            .push("negotiate");

        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus {
                operation: "negotiate",
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<NegotiateResponse>().await?)
    }

    async fn open(
        &self,
        kind: TransportKind,
        hub_url: &Url,
        connection_id: Option<&str>,
        access_token: &str,
    ) -> Result<TransportChannel, TransportError> {
        match kind {
            TransportKind::WebSockets => {
                let url = with_connection_id(&ws_url(hub_url)?, connection_id);
                websocket::connect(&url, access_token).await
            }
            TransportKind::LongPolling => {
                let url = with_connection_id(&http_url(hub_url)?, connection_id);
                long_polling::connect(&self.http, &url, access_token, self.long_poll_timeout)
                    .await
            }
        }
    }
}

#[async_trait]
impl Connector for HubConnector {
    async fn connect(
        &self,
        hub_url: &Url,
        access_token: &str,
    ) -> Result<TransportChannel, TransportError> {
        if self.skip_negotiation {
            if !self.transports.contains(&TransportKind::WebSockets) {
                return Err(TransportError::NoTransport {
                    wanted: self.transports.clone(),
                    offered: vec![TransportKind::WebSockets],
                });
            }
            return self
                .open(TransportKind::WebSockets, hub_url, None, access_token)
                .await;
        }

        let negotiation = self.negotiate(hub_url, access_token).await?;
        let candidates = select_transports(&self.transports, &negotiation.available_transports);
        if candidates.is_empty() {
            return Err(TransportError::NoTransport {
                wanted: self.transports.clone(),
                offered: negotiation.available_transports,
            });
        }

        let mut last_error = None;
        for kind in candidates {
            crate::log_debug!("trying {} transport for {}", kind, hub_url);
            match self
                .open(kind, hub_url, Some(&negotiation.connection_id), access_token)
                .await
            {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    crate::log_warn!("{} transport failed: {}", kind, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(TransportError::NoTransport {
            wanted: self.transports.clone(),
            offered: negotiation.available_transports,
        }))
    }
}

/// Client preference order, restricted to what the hub offers.
pub fn select_transports(
    preferred: &[TransportKind],
    offered: &[TransportKind],
) -> Vec<TransportKind> {
    preferred
        .iter()
        .copied()
        .filter(|kind| offered.contains(kind))
        .collect()
}
