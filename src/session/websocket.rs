//! WebSocket transport (`ws://` or `wss://`) for the session channel.

use crate::error::{ParleyError, Result};
use crate::session::transport::{Connector, TransportRx, TransportTx};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a remote engine over WebSocket.
#[derive(Clone)]
pub struct WebSocketConnector {
    endpoint: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl WebSocketConnector {
    /// `api_key`, when present, is sent as a bearer token.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<(Box<dyn TransportTx>, Box<dyn TransportRx>)> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ParleyError::fault(format!("invalid endpoint '{}': {}", self.endpoint, e)))?;

        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| ParleyError::fault(format!("invalid API key: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| ParleyError::fault(format!("connect to {} failed: {}", self.endpoint, e)))?;
        tracing::debug!(endpoint = %self.endpoint, status = %response.status(), "websocket connected");

        let (writer, reader) = stream.split();
        Ok((Box::new(WsTx(writer)), Box::new(WsRx(reader))))
    }
}

struct WsTx(SplitSink<WsStream, Message>);

#[async_trait]
impl TransportTx for WsTx {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.0
            .send(Message::text(text))
            .await
            .map_err(|e| ParleyError::fault(format!("websocket send failed: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        match self.0.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ParleyError::fault(format!("websocket close failed: {}", e))),
        }
    }
}

struct WsRx(SplitStream<WsStream>);

#[async_trait]
impl TransportRx for WsRx {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        loop {
            let message = match self.0.next().await? {
                Ok(message) => message,
                Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                    return None;
                }
                Err(e) => {
                    return Some(Err(ParleyError::fault(format!("websocket receive failed: {}", e))));
                }
            };
            match message {
                Message::Text(text) => return Some(Ok(text.to_string())),
                // Some engines send JSON in binary frames.
                Message::Binary(bytes) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Message::Close(frame) => {
                    if let Some(frame) = frame {
                        tracing::debug!(code = ?frame.code, reason = frame.reason.as_str(), "websocket closed by remote");
                    }
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}
