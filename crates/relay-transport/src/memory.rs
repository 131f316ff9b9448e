//! In-memory feed transport.
//!
//! [`MemoryConnector`] hands every accepted connection's far end to a
//! [`MemoryAcceptor`] as a [`MemoryFeed`], which can push records, inject
//! failures, read the handshake and observe the close.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::traits::{FeedConnection, FeedConnector, TransportError};

/// Connector backed by in-process channels.
#[derive(Debug)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryFeed>,
    refused: DashSet<String>,
    attempts: DashMap<String, usize>,
}

impl MemoryConnector {
    /// Create a connector and the acceptor that receives its feeds.
    #[must_use]
    pub fn new() -> (Self, MemoryAcceptor) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accepted,
            refused: DashSet::new(),
            attempts: DashMap::new(),
        };
        (connector, MemoryAcceptor { accepted: rx })
    }

    /// Refuse future connections for an instrument.
    pub fn refuse(&self, instrument: impl Into<String>) {
        self.refused.insert(instrument.into());
    }

    /// Accept future connections for an instrument again.
    pub fn allow(&self, instrument: &str) {
        self.refused.remove(instrument);
    }

    /// Number of connection attempts made for an instrument.
    #[must_use]
    pub fn attempts(&self, instrument: &str) -> usize {
        self.attempts.get(instrument).map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl FeedConnector for MemoryConnector {
    async fn connect(&self, instrument: &str) -> Result<Box<dyn FeedConnection>, TransportError> {
        *self.attempts.entry(instrument.to_string()).or_insert(0) += 1;

        if self.refused.contains(instrument) {
            debug!(instrument = %instrument, "Memory feed refused connection");
            return Err(TransportError::ConnectFailed(format!(
                "connection to {instrument} refused"
            )));
        }

        let (to_link, inbound) = mpsc::unbounded_channel();
        let (outbound, from_link) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let feed = MemoryFeed {
            instrument: instrument.to_string(),
            to_link,
            from_link,
            closed: closed_rx,
        };
        self.accepted
            .send(feed)
            .map_err(|_| TransportError::ConnectFailed("memory acceptor dropped".into()))?;

        Ok(Box::new(MemoryConnection {
            inbound,
            outbound,
            closed: closed_tx,
            open: true,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Receives the far end of every connection a [`MemoryConnector`] opens.
#[derive(Debug)]
pub struct MemoryAcceptor {
    accepted: mpsc::UnboundedReceiver<MemoryFeed>,
}

impl MemoryAcceptor {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryFeed> {
        self.accepted.recv().await
    }

    /// Take an already opened connection, if any.
    pub fn try_accept(&mut self) -> Option<MemoryFeed> {
        self.accepted.try_recv().ok()
    }
}

/// The feed side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryFeed {
    instrument: String,
    to_link: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    from_link: mpsc::UnboundedReceiver<String>,
    closed: watch::Receiver<bool>,
}

impl MemoryFeed {
    /// Instrument this connection was opened for.
    #[must_use]
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Push a record to the link. Returns `false` if the link side is gone.
    pub fn push(&self, record: impl Into<String>) -> bool {
        self.to_link.send(Ok(Bytes::from(record.into()))).is_ok()
    }

    /// Make the link's next receive fail with a transport error.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.to_link
            .send(Err(TransportError::ReceiveFailed(reason.into())))
            .is_ok()
    }

    /// Next text message sent by the link (the handshake).
    pub async fn next_request(&mut self) -> Option<String> {
        self.from_link.recv().await
    }

    /// Wait until the link closes or drops its side.
    pub async fn closed(&mut self) {
        while !*self.closed.borrow_and_update() {
            if self.closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the link has closed its side.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.to_link.is_closed()
    }
}

/// The link side of an in-memory connection.
struct MemoryConnection {
    inbound: mpsc::UnboundedReceiver<Result<Bytes, TransportError>>,
    outbound: mpsc::UnboundedSender<String>,
    closed: watch::Sender<bool>,
    open: bool,
}

#[async_trait]
impl FeedConnection for MemoryConnection {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(text)
            .map_err(|_| TransportError::SendFailed("memory feed dropped".into()))
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        match self.inbound.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(e)) => {
                self.open = false;
                Err(e)
            }
            None => {
                self.open = false;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}
