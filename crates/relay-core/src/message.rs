//! Feed messages as they travel from an upstream link to the router.

use relay_protocol::{FeedFrame, FeedKind, ServerFrame};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::instrument::InstrumentId;

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// An instrument-tagged record received from the feed.
///
/// Immutable once received; shared as `Arc<FeedMessage>` between the router
/// and the archive.
#[derive(Debug, Clone)]
pub struct FeedMessage {
    /// Unique message identifier.
    pub id: MessageId,
    /// Instrument the record belongs to.
    pub instrument: InstrumentId,
    /// Record classification.
    pub kind: FeedKind,
    /// Raw upstream record type.
    pub event: String,
    /// Whether the record goes to the archive.
    pub archivable: bool,
    /// The full upstream record.
    pub payload: Arc<Value>,
    /// Receive time in milliseconds since the epoch.
    pub received_at: u64,
}

impl FeedMessage {
    /// Create a new message.
    #[must_use]
    pub fn new(instrument: impl Into<InstrumentId>, kind: FeedKind, payload: Value) -> Self {
        Self {
            id: generate_message_id(),
            instrument: instrument.into(),
            kind,
            event: String::new(),
            archivable: false,
            payload: Arc::new(payload),
            received_at: now_millis(),
        }
    }

    /// Create a message from a decoded feed frame.
    #[must_use]
    pub fn from_frame(frame: FeedFrame) -> Self {
        Self {
            event: frame.event,
            archivable: frame.archivable,
            ..Self::new(frame.instrument, frame.kind, frame.payload)
        }
    }

    /// Set the raw upstream record type.
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    /// Mark the message for archiving.
    #[must_use]
    pub fn archivable(mut self, archivable: bool) -> Self {
        self.archivable = archivable;
        self
    }

    /// The client-facing `data` frame for this message.
    #[must_use]
    pub fn to_data_frame(&self) -> ServerFrame {
        ServerFrame::data(self.instrument.clone(), self.kind, self.payload.as_ref().clone())
    }

    /// The archive record for this message.
    #[must_use]
    pub fn to_record(&self) -> Value {
        json!({
            "id": self.id,
            "instrument": self.instrument,
            "kind": self.kind,
            "event": self.event,
            "received_at": self.received_at,
            "payload": self.payload.as_ref(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::FeedDialect;

    #[test]
    fn test_message_from_frame() {
        let frame = FeedDialect::Coinbase
            .decode(br#"{"type":"l2update","product_id":"BTC-USD","changes":[]}"#)
            .unwrap()
            .unwrap();
        let msg = FeedMessage::from_frame(frame);

        assert_eq!(msg.instrument, "BTC-USD");
        assert_eq!(msg.kind, FeedKind::SnapshotDelta);
        assert_eq!(msg.event, "l2update");
        assert!(msg.archivable);
        assert!(msg.received_at > 0);
    }

    #[test]
    fn test_data_frame_and_record() {
        let msg = FeedMessage::new("ETH-USD", FeedKind::Trade, json!({"price": "3000"}))
            .with_event("match")
            .archivable(true);

        match msg.to_data_frame() {
            ServerFrame::Data {
                instrument,
                kind,
                payload,
            } => {
                assert_eq!(instrument, "ETH-USD");
                assert_eq!(kind, FeedKind::Trade);
                assert_eq!(payload["price"], "3000");
            }
            other => panic!("Expected data frame, got {:?}", other),
        }

        let record = msg.to_record();
        assert_eq!(record["kind"], "trade");
        assert_eq!(record["event"], "match");
        assert_eq!(record["payload"]["price"], "3000");
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        assert_ne!(id1, id2);
    }
}
