//! # relay-protocol
//!
//! Wire protocol definitions for the Relay market-data multiplexer.
//!
//! Two wire formats live here:
//!
//! - **Client frames** - what downstream sessions send (`subscribe`, `unsubscribe`, `ping`)
//!   and receive (`data`, `subscribed`, `unsubscribed`, `system_status`, ...). Frames travel
//!   as JSON text or as length-prefixed MessagePack binary.
//! - **Feed frames** - what the upstream market-data feed speaks: the per-instrument
//!   subscribe handshake and the tagged records it streams back.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, ServerFrame};
//!
//! let frame = ServerFrame::subscribed("BTC-USD");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded: ServerFrame = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod feed;
pub mod frames;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use feed::{FeedDialect, FeedFrame, FeedKind};
pub use frames::{error_codes, ClientFrame, ServerFrame, PROTOCOL_VERSION};
