//! # relay-core
//!
//! Subscription registry, upstream links and the fan-out router for the Relay
//! market-data multiplexer.
//!
//! This crate provides the coordination logic:
//!
//! - **SubscriptionRegistry** - who listens to which instrument, in both directions
//! - **UpstreamLink** - one feed connection per instrument, decoding and tagging frames
//! - **Router** - the single actor that opens and closes links against the registry
//!   and fans feed messages out to sessions
//! - **Session / Archive / Auth** - the seams to the gateway and external collaborators
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  commands  ┌─────────────┐  spawn/close  ┌──────────────┐
//! │   Session   │───────────▶│   Router    │──────────────▶│ UpstreamLink │
//! └─────────────┘            └─────────────┘               └──────────────┘
//!        ▲                     │        ▲                        │
//!        │   data / acks       │        │      link events       │
//!        └─────────────────────┘        └────────────────────────┘
//!                              │
//!                              ▼
//!                    ┌──────────────────────┐
//!                    │ SubscriptionRegistry │
//!                    └──────────────────────┘
//! ```

pub mod archive;
pub mod auth;
pub mod instrument;
pub mod link;
pub mod message;
pub mod registry;
pub mod router;
pub mod session;

pub use archive::{ArchiveError, ArchiveOutcome, FeedArchive, NoopArchive};
pub use auth::{AuthError, Authenticator};
pub use instrument::{validate_instrument, InstrumentId};
pub use link::{LinkConfig, LinkFailure, LinkHandle, LinkId, LinkState};
pub use message::FeedMessage;
pub use registry::SubscriptionRegistry;
pub use router::{Router, RouterConfig, RouterError, RouterHandle, RouterStats};
pub use session::{DeliveryError, Principal, SessionId, SessionOutbox};
