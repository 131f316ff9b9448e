//! Upstream feed wire format.
//!
//! The upstream feed is a JSON message stream, one connection per instrument. The relay
//! sends one subscribe handshake and then reads tagged records. Two dialects are understood:
//!
//! | dialect    | handshake                                          | tag          | kind field |
//! |------------|----------------------------------------------------|--------------|------------|
//! | `coinbase` | `{"type":"subscribe","product_ids":[..],"channels":[..]}` | `product_id` | `type` |
//! | `generic`  | `{"action":"subscribe","instruments":[..],"channels":[..]}` | `instrument` | `kind` |

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::codec::ProtocolError;

/// Classification of a feed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedKind {
    /// Order-book snapshot or incremental book update.
    SnapshotDelta,
    /// Trade print.
    Trade,
    /// Anything else (heartbeats, tickers, status records).
    Other,
}

impl FeedKind {
    /// Kind name as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::SnapshotDelta => "snapshot-delta",
            FeedKind::Trade => "trade",
            FeedKind::Other => "other",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedDialect {
    /// Coinbase Exchange websocket feed.
    #[default]
    Coinbase,
    /// Instrument/kind tagged records.
    Generic,
}

impl FeedDialect {
    /// Field holding the instrument tag.
    #[must_use]
    pub fn instrument_field(&self) -> &'static str {
        match self {
            FeedDialect::Coinbase => "product_id",
            FeedDialect::Generic => "instrument",
        }
    }

    /// Field holding the record type.
    #[must_use]
    pub fn kind_field(&self) -> &'static str {
        match self {
            FeedDialect::Coinbase => "type",
            FeedDialect::Generic => "kind",
        }
    }

    /// Classify a raw record type.
    #[must_use]
    pub fn classify(&self, event: &str) -> FeedKind {
        match (self, event) {
            (FeedDialect::Coinbase, "snapshot" | "l2update") => FeedKind::SnapshotDelta,
            (FeedDialect::Coinbase, "match" | "last_match") => FeedKind::Trade,
            (FeedDialect::Generic, "snapshot-delta") => FeedKind::SnapshotDelta,
            (FeedDialect::Generic, "trade") => FeedKind::Trade,
            _ => FeedKind::Other,
        }
    }

    /// Whether records of this raw type go to the archive.
    #[must_use]
    pub fn is_archivable(&self, event: &str) -> bool {
        match self {
            FeedDialect::Coinbase => matches!(event, "l2update" | "match"),
            FeedDialect::Generic => matches!(event, "snapshot-delta" | "trade"),
        }
    }

    /// Build the subscribe handshake for one instrument.
    #[must_use]
    pub fn subscribe_request(&self, instrument: &str, channels: &[String]) -> String {
        let request = match self {
            FeedDialect::Coinbase => json!({
                "type": "subscribe",
                "product_ids": [instrument],
                "channels": channels,
            }),
            FeedDialect::Generic => json!({
                "action": "subscribe",
                "instruments": [instrument],
                "channels": channels,
            }),
        };
        request.to_string()
    }

    /// Decode one inbound feed frame.
    ///
    /// Returns `Ok(None)` for well-formed records without an instrument tag
    /// (subscription confirmations, heartbeats without a product).
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object.
    pub fn decode(&self, raw: &[u8]) -> Result<Option<FeedFrame>, ProtocolError> {
        let payload: Value = serde_json::from_slice(raw)?;
        let Some(record) = payload.as_object() else {
            return Err(ProtocolError::Invalid("feed frame is not an object".into()));
        };

        let instrument = match record.get(self.instrument_field()).and_then(Value::as_str) {
            Some(instrument) if !instrument.is_empty() => instrument.to_string(),
            _ => return Ok(None),
        };

        let event = record
            .get(self.kind_field())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Some(FeedFrame {
            instrument,
            kind: self.classify(&event),
            archivable: self.is_archivable(&event),
            event,
            payload,
        }))
    }
}

impl fmt::Display for FeedDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedDialect::Coinbase => f.write_str("coinbase"),
            FeedDialect::Generic => f.write_str("generic"),
        }
    }
}

/// A decoded, instrument-tagged feed record.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedFrame {
    /// Instrument tag.
    pub instrument: String,
    /// Classified kind.
    pub kind: FeedKind,
    /// Raw record type as sent upstream.
    pub event: String,
    /// Whether the record should be archived.
    pub archivable: bool,
    /// The full record.
    pub payload: Value,
}
