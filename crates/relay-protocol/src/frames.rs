//! Client-facing frame types.
//!
//! Every frame carries a `type` tag so JSON clients can dispatch on it directly:
//!
//! ```json
//! {"type":"subscribe","instrument":"BTC-USD"}
//! {"type":"data","instrument":"BTC-USD","kind":"trade","payload":{...}}
//! ```

use serde::{Deserialize, Serialize};

use crate::feed::FeedKind;

/// Current client protocol version, reported in the `connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by [`ServerFrame::Error`].
pub mod error_codes {
    /// The frame could not be decoded.
    pub const INVALID_FRAME: u16 = 1001;
    /// The instrument identifier was rejected.
    pub const INVALID_INSTRUMENT: u16 = 1002;
    /// The session holds too many subscriptions.
    pub const SUBSCRIPTION_LIMIT: u16 = 1003;
    /// The frame type is not accepted from clients.
    pub const UNSUPPORTED: u16 = 1004;
    /// The relay is shutting down or otherwise unable to serve the request.
    pub const UNAVAILABLE: u16 = 1005;
}

/// A frame sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving data for an instrument.
    Subscribe {
        /// Instrument to subscribe to.
        #[serde(alias = "product_id")]
        instrument: String,
    },

    /// Stop receiving data for an instrument.
    Unsubscribe {
        /// Instrument to unsubscribe from.
        #[serde(alias = "product_id")]
        instrument: String,
    },

    /// Keepalive ping.
    Ping {
        /// Optional timestamp, echoed back in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(instrument: impl Into<String>) -> Self {
        ClientFrame::Subscribe {
            instrument: instrument.into(),
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(instrument: impl Into<String>) -> Self {
        ClientFrame::Unsubscribe {
            instrument: instrument.into(),
        }
    }

    /// Frame type name, as it appears in the `type` tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Subscribe { .. } => "subscribe",
            ClientFrame::Unsubscribe { .. } => "unsubscribe",
            ClientFrame::Ping { .. } => "ping",
        }
    }
}

/// A frame sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Session established.
    Connected {
        /// Unique session identifier.
        session_id: String,
        /// Protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// A feed record for a subscribed instrument.
    Data {
        /// Instrument the record belongs to.
        instrument: String,
        /// Record classification.
        kind: FeedKind,
        /// The upstream record, forwarded untouched.
        payload: serde_json::Value,
    },

    /// Subscription confirmed.
    Subscribed {
        /// Instrument now subscribed.
        instrument: String,
    },

    /// Unsubscription confirmed.
    Unsubscribed {
        /// Instrument no longer subscribed.
        instrument: String,
    },

    /// Out-of-band notice about feed health.
    SystemStatus {
        /// Human-readable notice.
        message: String,
    },

    /// A request could not be served.
    Error {
        /// Error code, see [`error_codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive pong.
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerFrame {
    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(session_id: impl Into<String>, heartbeat: u32) -> Self {
        ServerFrame::Connected {
            session_id: session_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }

    /// Create a new Data frame.
    #[must_use]
    pub fn data(instrument: impl Into<String>, kind: FeedKind, payload: serde_json::Value) -> Self {
        ServerFrame::Data {
            instrument: instrument.into(),
            kind,
            payload,
        }
    }

    /// Create a new Subscribed frame.
    #[must_use]
    pub fn subscribed(instrument: impl Into<String>) -> Self {
        ServerFrame::Subscribed {
            instrument: instrument.into(),
        }
    }

    /// Create a new Unsubscribed frame.
    #[must_use]
    pub fn unsubscribed(instrument: impl Into<String>) -> Self {
        ServerFrame::Unsubscribed {
            instrument: instrument.into(),
        }
    }

    /// Create a new SystemStatus frame.
    #[must_use]
    pub fn system_status(message: impl Into<String>) -> Self {
        ServerFrame::SystemStatus {
            message: message.into(),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerFrame::Pong { timestamp }
    }

    /// Frame type name, as it appears in the `type` tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::Data { .. } => "data",
            ServerFrame::Subscribed { .. } => "subscribed",
            ServerFrame::Unsubscribed { .. } => "unsubscribed",
            ServerFrame::SystemStatus { .. } => "system_status",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Pong { .. } => "pong",
        }
    }
}
