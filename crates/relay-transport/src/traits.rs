//! Transport abstraction traits for upstream feeds.
//!
//! These traits define the interface every upstream transport provides,
//! keeping upstream links transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish the connection.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound message exceeds the configured limit.
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens feed connections, one per instrument.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Open a connection for the given instrument.
    ///
    /// The connection is ready for the subscribe handshake when this returns.
    async fn connect(&self, instrument: &str) -> Result<Box<dyn FeedConnection>, TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

/// An open, message-oriented connection to the feed.
#[async_trait]
pub trait FeedConnection: Send {
    /// Send a text message (the subscribe handshake).
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Receive the next data message.
    ///
    /// Returns `None` if the peer closed the connection. Control messages are
    /// handled internally and never surface here.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
