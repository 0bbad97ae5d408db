//! WebSocket transport using tokio-tungstenite.

use fitchat_shared::TransportKind;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{TransportChannel, TransportMessage};
use crate::error::TransportError;

/// Open a WebSocket to `url` with the bearer token attached, and spawn the
/// reader and writer tasks that own it.
pub async fn connect(url: &Url, access_token: &str) -> Result<TransportChannel, TransportError> {
    let mut request = url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
        .map_err(|_| TransportError::InvalidToken)?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (ws_stream, _response) = connect_async(request).await?;
    crate::log_info!("WebSocket connected to {}", url);

    let (mut write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportMessage>();

    // Reader
    let host = url.host_str().unwrap_or_default().to_string();
    tokio::spawn(async move {
        let reason = loop {
            let Some(msg_result) = read.next().await else {
                break None;
            };
            match msg_result {
                Ok(Message::Text(text)) => {
                    if inbound_tx
                        .send(TransportMessage::Text(text.as_str().to_string()))
                        .is_err()
                    {
                        // Connection layer let go of the channel.
                        return;
                    }
                }
                Ok(Message::Close(frame)) => {
                    crate::log_info!("WebSocket to {} received close frame", host);
                    break frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty());
                }
                Ok(Message::Ping(data)) => {
                    // Pong is handled automatically by tungstenite
                    crate::log_debug!("Received ping: {:?}", data);
                }
                Ok(_) => {
                    // Ignore binary, pong, etc.
                }
                Err(e) => {
                    crate::log_error!("WebSocket read error: {}", e);
                    break Some(e.to_string());
                }
            }
        };
        let _ = inbound_tx.send(TransportMessage::Closed(reason));
    });

    // Writer
    tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if let Err(e) = write.send(Message::text(text)).await {
                crate::log_error!("WebSocket send failed: {}", e);
                return;
            }
        }
        // Sender dropped: the connection layer is done with this channel.
        if let Err(e) = write.close().await {
            crate::log_debug!("WebSocket close failed: {}", e);
        }
    });

    Ok(TransportChannel::new(
        TransportKind::WebSockets,
        outbound_tx,
        inbound_rx,
    ))
}
