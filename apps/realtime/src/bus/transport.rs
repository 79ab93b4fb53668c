//! Raw text-message links to the broker.
//!
//! A [`Link`] is a pair of channels: text written to `outbound` goes to the
//! broker, text from the broker arrives on `inbound`. When the underlying
//! socket dies the `inbound` channel closes, which is how the connection
//! detects transport failure.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use crate::error::Result;

/// One open transport link.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links to the broker.
///
/// Backed by a WebSocket in production and in-memory channels in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Link>;

    /// Value of the STOMP `host` header.
    fn host(&self) -> String;
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Link> {
        let request = self.url.as_str().into_client_request()?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!(url = %self.url, "websocket opened");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Writer: ends when every outbound sender is dropped, then closes the socket.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    tracing::debug!(?e, "websocket write failed");
                    return;
                }
            }
            let _ = ws_tx.close().await;
        });

        // Reader: dropping `in_tx` on exit is the failure signal.
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if in_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(_) => tracing::warn!(%url, "dropping non-utf8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(%url, ?frame, "websocket closed by broker");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(?e, %url, "websocket read error");
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn host(&self) -> String {
        host_of(&self.url)
    }
}

/// Host of a ws/http URL, without brackets, port or path.
fn host_of(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => parsed
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .unwrap_or_else(|| "localhost".into()),
        Err(err) => {
            tracing::warn!(%err, url, "bus url has no parsable host");
            "localhost".into()
        }
    }
}
