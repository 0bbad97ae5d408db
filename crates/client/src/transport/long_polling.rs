//! Long-polling transport over plain HTTP.
//!
//! `GET {hub}?id=…` returns a JSON array of pending frames (empty when the
//! poll times out on the hub, 404 once the connection is gone),
//! `POST {hub}?id=…` carries one frame, `DELETE {hub}?id=…` closes.

use std::time::Duration;

use fitchat_shared::TransportKind;
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use url::Url;

use super::{TransportChannel, TransportMessage};
use crate::error::TransportError;

/// Open a long-polling channel for an already negotiated `connection_id`.
///
/// The first poll is made before returning so a hub that cannot serve this
/// transport fails the attempt instead of the first frame.
pub async fn connect(
    http: &Client,
    url: &Url,
    access_token: &str,
    poll_timeout: Duration,
) -> Result<TransportChannel, TransportError> {
    let first = poll(http, url, access_token, poll_timeout).await?;
    let Some(initial_frames) = first else {
        return Err(TransportError::Closed(Some(
            "hub closed the poll before it opened".to_string(),
        )));
    };
    crate::log_info!("Long polling connected to {}", url);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportMessage>();

    for frame in initial_frames {
        let _ = inbound_tx.send(TransportMessage::Text(frame));
    }

    // Poll loop
    let (poll_http, poll_url, poll_token) = (http.clone(), url.clone(), access_token.to_string());
    tokio::spawn(async move {
        let reason = loop {
            let outcome = tokio::select! {
                outcome = poll(&poll_http, &poll_url, &poll_token, poll_timeout) => outcome,
                _ = inbound_tx.closed() => return,
            };
            match outcome {
                Ok(Some(frames)) => {
                    for frame in frames {
                        if inbound_tx.send(TransportMessage::Text(frame)).is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => break None,
                Err(e) => {
                    crate::log_error!("Long poll failed: {}", e);
                    break Some(e.to_string());
                }
            }
        };
        let _ = inbound_tx.send(TransportMessage::Closed(reason));
    });

    // Send loop
    let (send_http, send_url, send_token) = (http.clone(), url.clone(), access_token.to_string());
    tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            let result = send_http
                .post(send_url.clone())
                .bearer_auth(&send_token)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(text)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    crate::log_error!("Long poll send rejected with {}", response.status());
                    return;
                }
                Err(e) => {
                    crate::log_error!("Long poll send failed: {}", e);
                    return;
                }
            }
        }
        // Sender dropped: tell the hub we are gone.
        let result = send_http
            .delete(send_url.clone())
            .bearer_auth(&send_token)
            .send()
            .await;
        if let Err(e) = result {
            crate::log_debug!("Long poll close failed: {}", e);
        }
    });

    Ok(TransportChannel::new(
        TransportKind::LongPolling,
        outbound_tx,
        inbound_rx,
    ))
}

/// One poll. `Ok(None)` means the hub has closed the connection.
async fn poll(
    http: &Client,
    url: &Url,
    access_token: &str,
    poll_timeout: Duration,
) -> Result<Option<Vec<String>>, TransportError> {
    let response = http
        .get(url.clone())
        .bearer_auth(access_token)
        .timeout(poll_timeout)
        .send()
        .await?;

    match response.status() {
        StatusCode::OK => Ok(Some(response.json::<Vec<String>>().await?)),
        StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
        status => Err(TransportError::UnexpectedStatus {
            operation: "poll",
            status: status.as_u16(),
        }),
    }
}
