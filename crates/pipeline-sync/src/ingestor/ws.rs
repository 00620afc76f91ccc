//! WebSocket push channel.

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::channel::{PushChannel, PushConnection};
use crate::error::{SyncError, SyncResult};

/// Push channel over a WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsPushChannel {
    url: String,
}

impl WsPushChannel {
    /// Create a channel for `url` (`ws://` or `wss://`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PushChannel for WsPushChannel {
    type Connection = WsConnection;

    async fn connect(&self) -> SyncResult<WsConnection> {
        let (stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| SyncError::Channel(format!("failed to connect to {}: {e}", self.url)))?;
        debug!(url = %self.url, "websocket connected");
        Ok(WsConnection { stream })
    }
}

/// An open WebSocket push connection.
#[derive(Debug)]
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl PushConnection for WsConnection {
    async fn next_message(&mut self) -> Option<SyncResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Ok(Message::Close(_)) => return None,
                // Ping, Pong, Frame
                Ok(_) => {}
                Err(e) => return Some(Err(SyncError::Channel(format!("websocket error: {e}")))),
            }
        }
    }
}
