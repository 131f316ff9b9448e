//! # relay-transport
//!
//! Upstream feed transports for the Relay market-data multiplexer.
//!
//! Every upstream link talks to the feed through the [`FeedConnector`] and
//! [`FeedConnection`] traits, so the core never depends on a concrete protocol:
//!
//! - **WebSocket** - `ws://` / `wss://` feeds via tokio-tungstenite
//! - **Memory** - channel-backed connections for tests and local replay
//!
//! ```rust,ignore
//! use relay_transport::{FeedConnector, FeedConnection};
//!
//! async fn pump(connector: &dyn FeedConnector) {
//!     let mut conn = connector.connect("BTC-USD").await.unwrap();
//!     while let Ok(Some(frame)) = conn.recv().await {
//!         // Decode frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryAcceptor, MemoryConnector, MemoryFeed};
pub use traits::{FeedConnection, FeedConnector, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
