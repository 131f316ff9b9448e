//! Upstream links.
//!
//! An [`UpstreamLink`] owns one feed connection for one instrument. It runs as
//! its own task, reports lifecycle events to the router, and is controlled
//! through the [`LinkHandle`] the router keeps.
//!
//! ```text
//! Connecting ──▶ Open ──▶ Closing ──▶ Closed
//!      │           │                    ▲
//!      └───────────┴──▶ Failed ─────────┘  (+ LinkEvent::Lost)
//! ```

use relay_protocol::FeedDialect;
use relay_transport::{FeedConnection, FeedConnector, TransportError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::archive::{archive_detached, FeedArchive};
use crate::instrument::InstrumentId;
use crate::message::FeedMessage;

/// Identifies one link instance. A reopened instrument gets a new ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Link lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Transport connect and handshake in progress.
    Connecting,
    /// Handshake sent; frames are being forwarded.
    Open,
    /// Close requested; transport shutting down.
    Closing,
    /// Terminal.
    Closed,
    /// Transport or protocol failure; transitions to `Closed` immediately.
    Failed,
}

/// Why a link failed.
#[derive(Debug, Error)]
pub enum LinkFailure {
    /// The feed could not be reached.
    #[error("Connect failed: {0}")]
    Connect(#[source] TransportError),

    /// The feed did not accept the connection in time.
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// The subscribe handshake could not be sent.
    #[error("Subscribe handshake failed: {0}")]
    Handshake(#[source] TransportError),

    /// The transport failed while open.
    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),

    /// The feed closed the connection.
    #[error("Feed closed the connection")]
    PeerClosed,
}

/// Link configuration shared by every link of a router.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upstream wire dialect.
    pub dialect: FeedDialect,
    /// Feed channels requested in the handshake.
    pub channels: Vec<String>,
    /// Maximum time to establish the transport.
    pub connect_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            dialect: FeedDialect::Coinbase,
            channels: vec!["level2".to_string(), "matches".to_string()],
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Frame counters shared by all links of a router.
#[derive(Debug, Default)]
pub struct LinkCounters {
    /// Frames forwarded to the router.
    pub forwarded: AtomicU64,
    /// Frames that failed to decode.
    pub malformed: AtomicU64,
    /// Well-formed frames without this link's instrument tag.
    pub untagged: AtomicU64,
}

/// Events a link reports to the router.
#[derive(Debug)]
pub enum LinkEvent {
    /// Handshake sent; the link is open.
    Opened {
        /// Link that opened.
        link: LinkId,
        /// Its instrument.
        instrument: InstrumentId,
    },
    /// A tagged feed message.
    Message {
        /// Link that received it.
        link: LinkId,
        /// The message.
        message: Arc<FeedMessage>,
    },
    /// The link failed and is closed.
    Lost {
        /// Link that failed.
        link: LinkId,
        /// Its instrument.
        instrument: InstrumentId,
        /// Failure cause.
        error: LinkFailure,
    },
}

/// Everything a link needs besides its identity.
#[derive(Clone)]
pub struct LinkContext {
    /// Link configuration.
    pub config: LinkConfig,
    /// Feed transport.
    pub connector: Arc<dyn FeedConnector>,
    /// Persistence collaborator.
    pub archive: Arc<dyn FeedArchive>,
    /// Router event queue.
    pub events: mpsc::Sender<LinkEvent>,
    /// Shared frame counters.
    pub counters: Arc<LinkCounters>,
}

/// Router-side handle to a running link.
///
/// Dropping the handle closes the link.
#[derive(Debug)]
pub struct LinkHandle {
    id: LinkId,
    instrument: InstrumentId,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<LinkState>,
}

impl LinkHandle {
    /// Link ID.
    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Instrument the link serves.
    #[must_use]
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Request close. Safe to call any number of times.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            debug!(link = %self.id, instrument = %self.instrument, "Closing upstream link");
        }
    }

    /// Whether close has been requested.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait until the link reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        while *state.borrow_and_update() != LinkState::Closed {
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One feed connection for one instrument.
pub struct UpstreamLink {
    id: LinkId,
    instrument: InstrumentId,
    ctx: LinkContext,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<LinkState>,
}

impl UpstreamLink {
    /// Start a link task and return its handle.
    ///
    /// Must be called from within a tokio runtime. Returns immediately; the
    /// connect and handshake happen on the link's own task.
    pub fn spawn(id: LinkId, instrument: impl Into<InstrumentId>, ctx: &LinkContext) -> LinkHandle {
        let instrument = instrument.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        let link = UpstreamLink {
            id,
            instrument: instrument.clone(),
            ctx: ctx.clone(),
            shutdown: shutdown_rx,
            state: state_tx,
        };
        tokio::spawn(link.run());

        LinkHandle {
            id,
            instrument,
            shutdown: shutdown_tx,
            state: state_rx,
        }
    }

    async fn run(mut self) {
        debug!(link = %self.id, instrument = %self.instrument, "Upstream link connecting");

        match self.drive().await {
            Ok(()) => {
                debug!(link = %self.id, instrument = %self.instrument, "Upstream link closed");
            }
            Err(error) if self.shutdown_requested() => {
                debug!(link = %self.id, instrument = %self.instrument, error = %error, "Upstream link error during close");
                self.set_state(LinkState::Closed);
            }
            Err(error) => {
                self.set_state(LinkState::Failed);
                warn!(link = %self.id, instrument = %self.instrument, error = %error, "Upstream link failed");
                self.set_state(LinkState::Closed);

                let event = LinkEvent::Lost {
                    link: self.id,
                    instrument: self.instrument.clone(),
                    error,
                };
                if self.ctx.events.send(event).await.is_err() {
                    debug!(link = %self.id, "Router gone, link loss not reported");
                }
            }
        }
    }

    async fn drive(&mut self) -> Result<(), LinkFailure> {
        let timeout = self.ctx.config.connect_timeout;
        let connected = tokio::select! {
            biased;
            () = shutdown_signal(&mut self.shutdown) => None,
            result = tokio::time::timeout(timeout, self.ctx.connector.connect(&self.instrument)) => Some(result),
        };

        let mut conn = match connected {
            None => {
                self.set_state(LinkState::Closing);
                self.set_state(LinkState::Closed);
                return Ok(());
            }
            Some(Err(_elapsed)) => return Err(LinkFailure::Timeout(timeout)),
            Some(Ok(Err(e))) => return Err(LinkFailure::Connect(e)),
            Some(Ok(Ok(conn))) => conn,
        };

        let handshake = self
            .ctx
            .config
            .dialect
            .subscribe_request(&self.instrument, &self.ctx.config.channels);
        conn.send_text(handshake)
            .await
            .map_err(LinkFailure::Handshake)?;

        self.set_state(LinkState::Open);
        info!(link = %self.id, instrument = %self.instrument, transport = self.ctx.connector.name(), "Upstream link open");
        let opened = LinkEvent::Opened {
            link: self.id,
            instrument: self.instrument.clone(),
        };
        if self.ctx.events.send(opened).await.is_err() {
            debug!(link = %self.id, "Router gone");
        }

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown_signal(&mut self.shutdown) => None,
                frame = conn.recv() => Some(frame),
            };

            match next {
                None => break,
                Some(Ok(Some(raw))) => self.forward(&raw).await,
                Some(Ok(None)) => return Err(LinkFailure::PeerClosed),
                Some(Err(e)) => return Err(LinkFailure::Transport(e)),
            }
        }

        self.close_transport(conn).await;
        Ok(())
    }

    async fn close_transport(&mut self, mut conn: Box<dyn FeedConnection>) {
        self.set_state(LinkState::Closing);
        if let Err(e) = conn.close().await {
            debug!(link = %self.id, error = %e, "Error closing feed transport");
        }
        self.set_state(LinkState::Closed);
    }

    /// Decode, tag and forward one frame.
    async fn forward(&self, raw: &[u8]) {
        if self.shutdown_requested() {
            trace!(link = %self.id, "Dropping frame received after close");
            return;
        }

        let counters = &self.ctx.counters;
        match self.ctx.config.dialect.decode(raw) {
            Ok(Some(frame)) if frame.instrument == self.instrument => {
                let message = Arc::new(FeedMessage::from_frame(frame));
                if message.archivable {
                    archive_detached(self.ctx.archive.clone(), message.clone());
                }

                counters.forwarded.fetch_add(1, Ordering::Relaxed);
                let event = LinkEvent::Message {
                    link: self.id,
                    message,
                };
                if self.ctx.events.send(event).await.is_err() {
                    debug!(link = %self.id, "Router gone, dropping message");
                }
            }
            Ok(Some(frame)) => {
                counters.untagged.fetch_add(1, Ordering::Relaxed);
                trace!(link = %self.id, tag = %frame.instrument, "Dropping frame for foreign instrument");
            }
            Ok(None) => {
                counters.untagged.fetch_add(1, Ordering::Relaxed);
                trace!(link = %self.id, "Dropping untagged frame");
            }
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(link = %self.id, error = %e, "Dropping malformed frame");
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
        trace!(link = %self.id, instrument = %self.instrument, ?state, "Link state");
    }
}

/// Resolves once close is requested or the handle is dropped.
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
