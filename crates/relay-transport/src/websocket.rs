//! WebSocket feed transport.
//!
//! Opens one tokio-tungstenite client connection per instrument. `wss://` URLs are
//! served over rustls with the platform's native root certificates.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::codec::MAX_FRAME_SIZE;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use crate::traits::{FeedConnection, FeedConnector, TransportError};

/// WebSocket connector configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Feed URL, e.g. `wss://ws-feed.exchange.coinbase.com`.
    pub url: String,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl WebSocketConfig {
    /// Create a configuration for the given feed URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

/// Connects to a WebSocket market-data feed.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector for the given feed URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(WebSocketConfig::new(url))
    }

    /// Create a connector with custom configuration.
    #[must_use]
    pub fn with_config(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// The feed URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl FeedConnector for WebSocketConnector {
    async fn connect(&self, instrument: &str) -> Result<Box<dyn FeedConnection>, TransportError> {
        debug!(instrument = %instrument, url = %self.config.url, "Connecting to feed");

        let (stream, response) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| {
                error!(instrument = %instrument, error = %e, "Feed handshake failed");
                TransportError::ConnectFailed(e.to_string())
            })?;

        debug!(
            instrument = %instrument,
            status = %response.status(),
            "Feed handshake completed"
        );

        Ok(Box::new(WebSocketFeedConnection::new(
            stream,
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A WebSocket connection to the feed.
pub struct WebSocketFeedConnection {
    stream: FeedStream,
    is_open: bool,
    max_message_size: usize,
}

impl WebSocketFeedConnection {
    fn new(stream: FeedStream, max_message_size: usize) -> Self {
        Self {
            stream,
            is_open: true,
            max_message_size,
        }
    }

    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Feed message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(TransportError::MessageTooLarge(len));
        }
        Ok(())
    }
}

#[async_trait]
impl FeedConnection for WebSocketFeedConnection {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(Bytes::from(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    return Ok(Some(Bytes::from(data)));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Feed sent close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("Feed stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(format!("Failed to close: {}", e))),
        }
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
