//! WebSocket transport backed by tokio-tungstenite.

use crate::{Connector, Transport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hmyload_core::{LoadError, LoadResult};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// Dials `ws://` or `wss://` endpoints.
///
/// ```ignore
/// let connector = WsConnector::new("wss://ws.s0.t.hmny.io", Duration::from_secs(30))?;
/// let transport = connector.connect().await?;
/// ```
pub struct WsConnector {
    url: Url,
    endpoint: String,
    dial_timeout: Duration,
}

impl WsConnector {
    pub fn new(rpc_url: &str, dial_timeout: Duration) -> LoadResult<Self> {
        if rpc_url.is_empty() {
            return Err(LoadError::InvalidInput("RPC URL must not be empty".into()));
        }
        let url = Url::parse(rpc_url)
            .map_err(|e| LoadError::InvalidInput(format!("Invalid RPC URL {rpc_url}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(LoadError::InvalidInput(format!(
                "RPC URL must use ws:// or wss://, got {rpc_url}"
            )));
        }
        Ok(Self {
            endpoint: rpc_url.to_string(),
            url,
            dial_timeout,
        })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> LoadResult<Box<dyn Transport>> {
        let rpc_url = self.endpoint.as_str();
        let (ws, _response) =
            tokio::time::timeout(self.dial_timeout, tokio_tungstenite::connect_async(self.url.as_str()))
                .await
                .map_err(|_| LoadError::Timeout {
                    method: format!("connect {rpc_url}"),
                    after: self.dial_timeout,
                })?
                .map_err(|e| LoadError::Transport(format!("Failed to connect to {rpc_url}: {e}")))?;

        tracing::debug!(rpc_url, "websocket open");
        Ok(Box::new(WsTransport { ws }))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> LoadResult<()> {
        self.ws
            .send(Message::Text(frame))
            .await
            .map_err(|e| LoadError::Transport(format!("Write failed: {e}")))
    }

    async fn recv(&mut self) -> LoadResult<String> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map_err(|e| LoadError::Transport(format!("Non UTF-8 frame: {e}")));
                }
                // Pings are answered by tungstenite on the next read or write.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    return Err(LoadError::Transport(format!("Closed by peer: {frame:?}")));
                }
                Some(Err(e)) => return Err(LoadError::Transport(format!("Read failed: {e}"))),
                None => return Err(LoadError::Transport("Stream ended".into())),
            }
        }
    }

    async fn close(&mut self) -> LoadResult<()> {
        self.ws
            .close(None)
            .await
            .map_err(|e| LoadError::Transport(format!("Close failed: {e}")))
    }
}
