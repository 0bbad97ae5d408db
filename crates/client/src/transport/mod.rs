//! Physical channels to the hub.
//!
//! A [`Connector`] turns a hub url and an access token into a
//! [`TransportChannel`]: a pair of text queues backed by background tasks
//! that own the socket or the HTTP polling loop. The connection layer above
//! only ever sees text frames, so every transport carries the same protocol.
//!
//! ```text
//!   HubConnection ──outbound──▶ writer task ──▶ socket / POST
//!        ▲
//!        └────────inbound───── reader task ◀── socket / GET
//! ```
//!
//! Dropping the channel's outbound sender ends the writer, which closes the
//! underlying connection.

use async_trait::async_trait;
use fitchat_shared::TransportKind;
use tokio::sync::mpsc;
use url::Url;

use crate::error::TransportError;

pub mod long_polling;
pub mod memory;
pub mod negotiate;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryHub, MemoryPeer};
pub use negotiate::HubConnector;

/// What a reader task delivers to the connection layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    /// The channel is gone; no further messages follow.
    Closed(Option<String>),
}

/// One open physical channel.
#[derive(Debug)]
pub struct TransportChannel {
    kind: TransportKind,
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportMessage>,
}

impl TransportChannel {
    pub fn new(
        kind: TransportKind,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<TransportMessage>,
    ) -> Self {
        Self {
            kind,
            outbound,
            inbound,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn into_parts(
        self,
    ) -> (
        TransportKind,
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<TransportMessage>,
    ) {
        (self.kind, self.outbound, self.inbound)
    }
}

/// Opens physical channels to the hub.
///
/// Called once per connection attempt with a freshly pulled access token.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        hub_url: &Url,
        access_token: &str,
    ) -> Result<TransportChannel, TransportError>;
}

/// `http(s)` form of the hub url, used for negotiate and long polling.
pub(crate) fn http_url(hub_url: &Url) -> Result<Url, TransportError> {
    with_scheme(hub_url, |scheme| match scheme {
        "ws" | "http" => Some("http"),
        "wss" | "https" => Some("https"),
        _ => None,
    })
}

/// `ws(s)` form of the hub url.
pub(crate) fn ws_url(hub_url: &Url) -> Result<Url, TransportError> {
    with_scheme(hub_url, |scheme| match scheme {
        "ws" | "http" => Some("ws"),
        "wss" | "https" => Some("wss"),
        _ => None,
    })
}

fn with_scheme(
    hub_url: &Url,
    pick: impl Fn(&str) -> Option<&'static str>,
) -> Result<Url, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidUrl {
        url: hub_url.to_string(),
        reason: reason.to_string(),
    };
    let scheme = pick(hub_url.scheme()).ok_or_else(|| invalid("unsupported scheme"))?;
    let mut url = hub_url.clone();
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch scheme"))?;
    Ok(url)
}

/// Hub url with `id=connection_id` appended to the query.
pub(crate) fn with_connection_id(url: &Url, connection_id: Option<&str>) -> Url {
    let mut url = url.clone();
    if let Some(id) = connection_id {
        url.query_pairs_mut().append_pair("id", id);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_between_http_and_ws_schemes() {
        let hub = Url::parse("https://api.example.com/hubs/chat").expect("url");
        assert_eq!(
            ws_url(&hub).expect("ws").as_str(),
            "wss://api.example.com/hubs/chat"
        );

        let hub = Url::parse("ws://localhost:8080/hubs/chat").expect("url");
        assert_eq!(
            http_url(&hub).expect("http").as_str(),
            "http://localhost:8080/hubs/chat"
        );
    }

    #[test]
    fn appends_connection_id() {
        let hub = Url::parse("http://localhost:8080/hubs/chat").expect("url");
        assert_eq!(
            with_connection_id(&hub, Some("abc")).as_str(),
            "http://localhost:8080/hubs/chat?id=abc"
        );
        assert_eq!(with_connection_id(&hub, None), hub);
    }
}
