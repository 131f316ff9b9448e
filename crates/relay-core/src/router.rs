//! Fan-out router for Relay.
//!
//! The router is a single actor task. It owns the [`SubscriptionRegistry`],
//! the session outboxes and the upstream links, so every "first subscriber
//! opens, last subscriber closes" decision is made in one place and in order.
//! Sessions talk to it through a cloneable [`RouterHandle`]; links report to
//! it through their own event queue.
//!
//! Closing a link only signals it; the router forgets the link at once. A
//! subscribe that arrives while the old link is still winding down opens a
//! fresh link, so for a short time two upstream connections exist for one
//! instrument. Only the newest one is current: frames and events carrying an
//! older [`LinkId`] are dropped as stale.

use relay_protocol::{error_codes, ServerFrame};
use relay_transport::FeedConnector;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::archive::FeedArchive;
use crate::instrument::{validate_instrument, InstrumentId};
use crate::link::{
    LinkConfig, LinkContext, LinkCounters, LinkEvent, LinkFailure, LinkHandle, LinkId, LinkState,
    UpstreamLink,
};
use crate::message::FeedMessage;
use crate::registry::SubscriptionRegistry;
use crate::session::{Principal, SessionId, SessionOutbox};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid instrument identifier.
    #[error("Invalid instrument: {0}")]
    InvalidInstrument(&'static str),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// The session was never connected or has already disconnected.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// The router task has stopped.
    #[error("Router is not running")]
    Closed,
}

impl RouterError {
    /// The `error` frame reported to the client for this error.
    #[must_use]
    pub fn to_frame(&self) -> ServerFrame {
        let code = match self {
            RouterError::InvalidInstrument(_) => error_codes::INVALID_INSTRUMENT,
            RouterError::MaxSubscriptionsReached => error_codes::SUBSCRIPTION_LIMIT,
            RouterError::UnknownSession(_) | RouterError::Closed => error_codes::UNAVAILABLE,
        };
        ServerFrame::error(code, self.to_string())
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum subscriptions per session.
    pub max_subscriptions_per_session: usize,
    /// Capacity of the command queue.
    pub command_capacity: usize,
    /// Capacity of the link event queue.
    pub link_event_capacity: usize,
    /// Replacement links opened after a loss before giving up.
    pub reopen_attempts: u32,
    /// Upstream link settings.
    pub link: LinkConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_session: 100,
            command_capacity: 1024,
            link_event_capacity: 4096,
            reopen_attempts: 1,
            link: LinkConfig::default(),
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Connected sessions.
    pub sessions: usize,
    /// Instruments with at least one subscriber.
    pub instruments: usize,
    /// Live upstream links.
    pub live_links: usize,
    /// Total (session, instrument) subscriptions.
    pub total_subscriptions: usize,
    /// Feed messages fanned out.
    pub messages_routed: u64,
    /// Frames queued to sessions.
    pub deliveries: u64,
    /// Frames dropped because a session's queue was closed or full.
    pub delivery_failures: u64,
    /// Messages dropped because their link was no longer current.
    pub stale_messages: u64,
    /// Links lost unexpectedly.
    pub link_failures: u64,
    /// Upstream frames that failed to decode.
    pub malformed_frames: u64,
    /// Upstream frames without the link's instrument tag.
    pub untagged_frames: u64,
}

enum Command {
    Connect {
        session: SessionId,
        principal: Principal,
        outbox: SessionOutbox,
    },
    Subscribe {
        session: SessionId,
        instrument: String,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    Unsubscribe {
        session: SessionId,
        instrument: String,
        reply: oneshot::Sender<Result<(), RouterError>>,
    },
    Disconnect {
        session: SessionId,
    },
    Stats {
        reply: oneshot::Sender<RouterStats>,
    },
    SubscribersOf {
        instrument: String,
        reply: oneshot::Sender<HashSet<SessionId>>,
    },
    LinkState {
        instrument: String,
        reply: oneshot::Sender<Option<LinkState>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Input {
    Command(Option<Command>),
    Link(LinkEvent),
}

/// Cloneable handle for talking to the router task.
#[derive(Clone)]
pub struct RouterHandle {
    commands: mpsc::Sender<Command>,
}

impl RouterHandle {
    /// Register a session and the queue its frames are delivered to.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Closed`] if the router has stopped.
    pub async fn connect(
        &self,
        session: SessionId,
        principal: Principal,
        outbox: SessionOutbox,
    ) -> Result<(), RouterError> {
        self.send(Command::Connect {
            session,
            principal,
            outbox,
        })
        .await
    }

    /// Subscribe a session to an instrument.
    ///
    /// The `subscribed` acknowledgement, or the `error` frame on rejection,
    /// is delivered through the session's outbox.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason, or [`RouterError::Closed`].
    pub async fn subscribe(
        &self,
        session: SessionId,
        instrument: impl Into<String>,
    ) -> Result<(), RouterError> {
        let instrument = instrument.into();
        self.request(|reply| Command::Subscribe {
            session,
            instrument,
            reply,
        })
        .await?
    }

    /// Unsubscribe a session from an instrument.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::UnknownSession`] or [`RouterError::Closed`].
    pub async fn unsubscribe(
        &self,
        session: SessionId,
        instrument: impl Into<String>,
    ) -> Result<(), RouterError> {
        let instrument = instrument.into();
        self.request(|reply| Command::Unsubscribe {
            session,
            instrument,
            reply,
        })
        .await?
    }

    /// Remove a session and all of its subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Closed`] if the router has stopped.
    pub async fn disconnect(&self, session: SessionId) -> Result<(), RouterError> {
        self.send(Command::Disconnect { session }).await
    }

    /// Current statistics.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Closed`] if the router has stopped.
    pub async fn stats(&self) -> Result<RouterStats, RouterError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Sessions currently subscribed to an instrument.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Closed`] if the router has stopped.
    pub async fn subscribers_of(
        &self,
        instrument: impl Into<String>,
    ) -> Result<HashSet<SessionId>, RouterError> {
        let instrument = instrument.into();
        self.request(|reply| Command::SubscribersOf { instrument, reply })
            .await
    }

    /// State of the instrument's current link, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Closed`] if the router has stopped.
    pub async fn link_state(
        &self,
        instrument: impl Into<String>,
    ) -> Result<Option<LinkState>, RouterError> {
        let instrument = instrument.into();
        self.request(|reply| Command::LinkState { instrument, reply })
            .await
    }

    /// Close every link and stop the router.
    ///
    /// Returns once the router has stopped. Calling it on a stopped router is
    /// a no-op.
    pub async fn shutdown(&self) {
        if self
            .request(|reply| Command::Shutdown { reply })
            .await
            .is_err()
        {
            debug!("Router already stopped");
        }
    }

    /// Check whether the router task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: Command) -> Result<(), RouterError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RouterError::Closed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RouterError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| RouterError::Closed)
    }
}

struct SessionEntry {
    principal: Principal,
    outbox: SessionOutbox,
}

struct LinkEntry {
    handle: LinkHandle,
    reopens_used: u32,
}

#[derive(Default)]
struct Counters {
    messages_routed: u64,
    deliveries: u64,
    delivery_failures: u64,
    stale_messages: u64,
    link_failures: u64,
}

/// The router actor.
///
/// Build it with [`Router::new`], then [`Router::spawn`] it. It stops on
/// [`RouterHandle::shutdown`] or when every handle is dropped.
pub struct Router {
    config: RouterConfig,
    registry: SubscriptionRegistry,
    sessions: HashMap<SessionId, SessionEntry>,
    links: HashMap<InstrumentId, LinkEntry>,
    link_ctx: LinkContext,
    link_counters: Arc<LinkCounters>,
    commands: mpsc::Receiver<Command>,
    link_events: mpsc::Receiver<LinkEvent>,
    next_link_id: u64,
    counters: Counters,
}

impl Router {
    /// Create a router and its handle.
    pub fn new(
        config: RouterConfig,
        connector: Arc<dyn FeedConnector>,
        archive: Arc<dyn FeedArchive>,
    ) -> (Self, RouterHandle) {
        info!(
            transport = connector.name(),
            archive = archive.name(),
            dialect = ?config.link.dialect,
            "Creating router with config: {:?}",
            config
        );

        let (command_tx, commands) = mpsc::channel(config.command_capacity.max(1));
        let (event_tx, link_events) = mpsc::channel(config.link_event_capacity.max(1));
        let link_counters = Arc::new(LinkCounters::default());
        let link_ctx = LinkContext {
            config: config.link.clone(),
            connector,
            archive,
            events: event_tx,
            counters: link_counters.clone(),
        };

        let router = Self {
            config,
            registry: SubscriptionRegistry::new(),
            sessions: HashMap::new(),
            links: HashMap::new(),
            link_ctx,
            link_counters,
            commands,
            link_events,
            next_link_id: 0,
            counters: Counters::default(),
        };
        (router, RouterHandle { commands: command_tx })
    }

    /// Run the router on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the router until shutdown.
    pub async fn run(mut self) {
        debug!("Router started");
        loop {
            let input = tokio::select! {
                biased;
                command = self.commands.recv() => Input::Command(command),
                Some(event) = self.link_events.recv() => Input::Link(event),
            };

            match input {
                Input::Command(Some(command)) => {
                    if self.handle_command(command).is_break() {
                        break;
                    }
                }
                Input::Command(None) => {
                    self.close_all();
                    break;
                }
                Input::Link(event) => self.handle_link_event(event),
            }

            debug_assert!(self.registry.is_consistent());
        }
        info!("Router stopped");
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect {
                session,
                principal,
                outbox,
            } => self.connect(session, principal, outbox),
            Command::Subscribe {
                session,
                instrument,
                reply,
            } => {
                let _ = reply.send(self.subscribe(&session, instrument));
            }
            Command::Unsubscribe {
                session,
                instrument,
                reply,
            } => {
                let _ = reply.send(self.unsubscribe(&session, &instrument));
            }
            Command::Disconnect { session } => self.disconnect(&session),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::SubscribersOf { instrument, reply } => {
                let _ = reply.send(self.registry.subscribers_of(&instrument));
            }
            Command::LinkState { instrument, reply } => {
                let state = self.links.get(&instrument).map(|entry| entry.handle.state());
                let _ = reply.send(state);
            }
            Command::Shutdown { reply } => {
                self.close_all();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn connect(&mut self, session: SessionId, principal: Principal, outbox: SessionOutbox) {
        debug!(session = %session, subject = %principal.subject, "Session registered");
        let entry = SessionEntry { principal, outbox };
        if let Some(previous) = self.sessions.insert(session.clone(), entry) {
            warn!(session = %session, subject = %previous.principal.subject, "Session re-registered, replacing outbox");
        }
    }

    fn subscribe(&mut self, session: &SessionId, instrument: String) -> Result<(), RouterError> {
        let Some(outbox) = self.sessions.get(session).map(|entry| entry.outbox.clone()) else {
            warn!(session = %session, instrument = %instrument, "Subscribe from unknown session ignored");
            return Err(RouterError::UnknownSession(session.clone()));
        };

        if let Err(e) = self.admit(session, &instrument) {
            debug!(session = %session, instrument = %instrument, error = %e, "Subscribe rejected");
            self.deliver(session, &outbox, Arc::new(e.to_frame()));
            return Err(e);
        }

        let first = self.registry.add(session, &instrument);
        if !self.links.contains_key(&instrument) {
            self.open_link(&instrument, 0);
        }
        debug!(session = %session, instrument = %instrument, first, "Subscribed to instrument");

        self.deliver(session, &outbox, Arc::new(ServerFrame::subscribed(instrument)));
        Ok(())
    }

    fn admit(&self, session: &SessionId, instrument: &str) -> Result<(), RouterError> {
        validate_instrument(instrument).map_err(RouterError::InvalidInstrument)?;

        if !self.registry.is_subscribed(session, instrument)
            && self.registry.subscription_count(session) >= self.config.max_subscriptions_per_session
        {
            return Err(RouterError::MaxSubscriptionsReached);
        }
        Ok(())
    }

    fn unsubscribe(&mut self, session: &SessionId, instrument: &str) -> Result<(), RouterError> {
        let Some(outbox) = self.sessions.get(session).map(|entry| entry.outbox.clone()) else {
            warn!(session = %session, instrument = %instrument, "Unsubscribe from unknown session ignored");
            return Err(RouterError::UnknownSession(session.clone()));
        };

        if self.registry.remove(session, instrument) {
            self.close_link(instrument);
        }
        debug!(session = %session, instrument = %instrument, "Unsubscribed from instrument");

        self.deliver(session, &outbox, Arc::new(ServerFrame::unsubscribed(instrument)));
        Ok(())
    }

    fn disconnect(&mut self, session: &SessionId) {
        if self.sessions.remove(session).is_none() {
            warn!(session = %session, "Disconnect from unknown session ignored");
        }

        let emptied = self.registry.remove_session(session);
        for instrument in &emptied {
            self.close_link(instrument);
        }
        debug!(session = %session, closed_links = emptied.len(), "Session removed");
    }

    fn stats(&self) -> RouterStats {
        RouterStats {
            sessions: self.sessions.len(),
            instruments: self.registry.instrument_count(),
            live_links: self.links.len(),
            total_subscriptions: self.registry.total_subscriptions(),
            messages_routed: self.counters.messages_routed,
            deliveries: self.counters.deliveries,
            delivery_failures: self.counters.delivery_failures,
            stale_messages: self.counters.stale_messages,
            link_failures: self.counters.link_failures,
            malformed_frames: self.link_counters.malformed.load(Ordering::Relaxed),
            untagged_frames: self.link_counters.untagged.load(Ordering::Relaxed),
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { link, instrument } => {
                if self.is_current(link, &instrument) {
                    debug!(link = %link, instrument = %instrument, "Link open");
                } else {
                    trace!(link = %link, instrument = %instrument, "Ignoring open of stale link");
                }
            }
            LinkEvent::Message { link, message } => self.on_upstream_message(link, &message),
            LinkEvent::Lost {
                link,
                instrument,
                error,
            } => self.on_link_lost(link, &instrument, &error),
        }
    }

    fn is_current(&self, link: LinkId, instrument: &str) -> bool {
        self.links
            .get(instrument)
            .is_some_and(|entry| entry.handle.id() == link)
    }

    /// Fan a feed message out to the instrument's subscribers.
    fn on_upstream_message(&mut self, link: LinkId, message: &FeedMessage) {
        if !self.is_current(link, &message.instrument) {
            self.counters.stale_messages += 1;
            trace!(link = %link, instrument = %message.instrument, "Dropping message from stale link");
            return;
        }
        // Only a link that delivers restores the reopen budget.
        if let Some(entry) = self.links.get_mut(&message.instrument) {
            entry.reopens_used = 0;
        }

        let frame = Arc::new(message.to_data_frame());
        let mut delivered = 0u64;
        let mut failed = 0u64;

        for session in self.registry.subscribers(&message.instrument) {
            let Some(entry) = self.sessions.get(session) else {
                continue;
            };
            match entry.outbox.deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    debug!(session = %session, instrument = %message.instrument, error = %e, "Dropping data frame");
                }
            }
        }

        self.counters.messages_routed += 1;
        self.counters.deliveries += delivered;
        self.counters.delivery_failures += failed;
        trace!(instrument = %message.instrument, kind = %message.kind, delivered, failed, "Routed feed message");
    }

    fn on_link_lost(&mut self, link: LinkId, instrument: &str, error: &LinkFailure) {
        if !self.is_current(link, instrument) {
            trace!(link = %link, instrument = %instrument, "Ignoring loss of stale link");
            return;
        }
        let Some(entry) = self.links.remove(instrument) else {
            return;
        };
        self.counters.link_failures += 1;

        let subscribers = self.registry.subscriber_count(instrument);
        if subscribers == 0 {
            debug!(link = %link, instrument = %instrument, error = %error, "Link lost without subscribers");
            return;
        }

        if entry.reopens_used < self.config.reopen_attempts {
            warn!(link = %link, instrument = %instrument, error = %error, subscribers, "Upstream link lost, reopening");
            self.notify(
                instrument,
                &format!("{instrument} feed interrupted; reconnecting"),
            );
            self.open_link(instrument, entry.reopens_used + 1);
        } else {
            warn!(link = %link, instrument = %instrument, error = %error, subscribers, "Upstream link lost, giving up");
            self.notify(
                instrument,
                &format!("{instrument} feed unavailable; subscribe again to retry"),
            );
        }
    }

    /// Send a `system_status` notice to every subscriber of an instrument.
    fn notify(&mut self, instrument: &str, message: &str) {
        let frame = Arc::new(ServerFrame::system_status(message));
        let mut failed = 0u64;
        for session in self.registry.subscribers(instrument) {
            if let Some(entry) = self.sessions.get(session) {
                if let Err(e) = entry.outbox.deliver(frame.clone()) {
                    failed += 1;
                    debug!(session = %session, instrument = %instrument, error = %e, "Dropping status notice");
                }
            }
        }
        self.counters.delivery_failures += failed;
    }

    fn deliver(&mut self, session: &SessionId, outbox: &SessionOutbox, frame: Arc<ServerFrame>) {
        let kind = frame.name();
        if let Err(e) = outbox.deliver(frame) {
            self.counters.delivery_failures += 1;
            debug!(session = %session, frame = kind, error = %e, "Dropping reply frame");
        }
    }

    fn open_link(&mut self, instrument: &str, reopens_used: u32) {
        self.next_link_id += 1;
        let id = LinkId(self.next_link_id);
        let handle = UpstreamLink::spawn(id, instrument, &self.link_ctx);
        info!(link = %id, instrument = %instrument, reopens_used, "Opening upstream link");

        let previous = self.links.insert(
            instrument.to_string(),
            LinkEntry {
                handle,
                reopens_used,
            },
        );
        if let Some(previous) = previous {
            previous.handle.close();
        }
    }

    fn close_link(&mut self, instrument: &str) {
        if let Some(entry) = self.links.remove(instrument) {
            info!(link = %entry.handle.id(), instrument = %instrument, "Closing upstream link");
            entry.handle.close();
        }
    }

    fn close_all(&mut self) {
        info!(links = self.links.len(), sessions = self.sessions.len(), "Router shutting down");
        for (_, entry) in self.links.drain() {
            entry.handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::NoopArchive;
    use relay_protocol::FeedKind;
    use relay_transport::{MemoryAcceptor, MemoryConnector, MemoryFeed};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        router: RouterHandle,
        connector: Arc<MemoryConnector>,
        acceptor: MemoryAcceptor,
    }

    fn start(config: RouterConfig) -> Harness {
        let (connector, acceptor) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (router, handle) = Router::new(config, connector.clone(), Arc::new(NoopArchive));
        router.spawn();
        Harness {
            router: handle,
            connector,
            acceptor,
        }
    }

    struct Client {
        id: SessionId,
        rx: mpsc::Receiver<Arc<ServerFrame>>,
    }

    impl Client {
        async fn next(&mut self) -> ServerFrame {
            let frame = timeout(WAIT, self.rx.recv()).await.unwrap().unwrap();
            frame.as_ref().clone()
        }

        async fn expect_data(&mut self, instrument: &str) -> serde_json::Value {
            match self.next().await {
                ServerFrame::Data {
                    instrument: got,
                    payload,
                    ..
                } => {
                    assert_eq!(got, instrument);
                    payload
                }
                other => panic!("Expected data, got {:?}", other),
            }
        }

        async fn expect_status(&mut self) -> String {
            match self.next().await {
                ServerFrame::SystemStatus { message } => message,
                other => panic!("Expected system status, got {:?}", other),
            }
        }

        async fn assert_quiet(&mut self) {
            settle().await;
            assert!(self.rx.try_recv().is_err(), "Expected no frames");
        }
    }

    async fn connect(router: &RouterHandle, id: &str, capacity: usize) -> Client {
        let (outbox, rx) = SessionOutbox::channel(capacity);
        let id = SessionId::new(id);
        router
            .connect(id.clone(), Principal::new(id.as_str()), outbox)
            .await
            .unwrap();
        Client { id, rx }
    }

    async fn subscribe(router: &RouterHandle, client: &mut Client, instrument: &str) {
        router.subscribe(client.id.clone(), instrument).await.unwrap();
        assert_eq!(client.next().await, ServerFrame::subscribed(instrument));
    }

    /// Accept the next upstream connection and consume its handshake.
    async fn accept(acceptor: &mut MemoryAcceptor) -> MemoryFeed {
        let mut feed = timeout(WAIT, acceptor.accept()).await.unwrap().unwrap();
        timeout(WAIT, feed.next_request()).await.unwrap().unwrap();
        feed
    }

    /// Let spawned link tasks and the router drain their queues.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    /// Wait until the router reports an open link for the instrument.
    async fn wait_open(router: &RouterHandle, instrument: &str) {
        timeout(WAIT, async {
            while router.link_state(instrument).await.unwrap() != Some(LinkState::Open) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    fn trade(instrument: &str, price: &str) -> String {
        format!(r#"{{"type":"match","product_id":"{instrument}","price":"{price}"}}"#)
    }

    #[tokio::test]
    async fn test_shared_link_lifecycle() {
        let mut h = start(RouterConfig::default());
        let mut a = connect(&h.router, "A", 16).await;
        let mut b = connect(&h.router, "B", 16).await;

        subscribe(&h.router, &mut a, "BTC-USD").await;
        let mut feed = accept(&mut h.acceptor).await;
        subscribe(&h.router, &mut b, "BTC-USD").await;
        wait_open(&h.router, "BTC-USD").await;

        feed.push(trade("BTC-USD", "100"));
        assert_eq!(a.expect_data("BTC-USD").await["price"], "100");
        assert_eq!(b.expect_data("BTC-USD").await["price"], "100");

        h.router.unsubscribe(a.id.clone(), "BTC-USD").await.unwrap();
        assert_eq!(a.next().await, ServerFrame::unsubscribed("BTC-USD"));
        feed.push(trade("BTC-USD", "101"));
        assert_eq!(b.expect_data("BTC-USD").await["price"], "101");
        a.assert_quiet().await;

        h.router.unsubscribe(b.id.clone(), "BTC-USD").await.unwrap();
        assert_eq!(b.next().await, ServerFrame::unsubscribed("BTC-USD"));
        timeout(WAIT, feed.closed()).await.unwrap();
        assert_eq!(h.router.link_state("BTC-USD").await.unwrap(), None);

        feed.push(trade("BTC-USD", "102"));
        b.assert_quiet().await;
        assert_eq!(h.connector.attempts("BTC-USD"), 1);
        assert!(h.acceptor.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let mut h = start(RouterConfig::default());
        let mut a = connect(&h.router, "A", 16).await;
        subscribe(&h.router, &mut a, "BTC-USD").await;
        let feed = accept(&mut h.acceptor).await;
        wait_open(&h.router, "BTC-USD").await;

        feed.push("{\"type\":\"match\",");
        feed.push(r#"{"type":"heartbeat"}"#);
        feed.push(trade("BTC-USD", "5"));

        assert_eq!(a.expect_data("BTC-USD").await["price"], "5");
        let stats = h.router.stats().await.unwrap();
        assert_eq!(stats.malformed_frames, 1);
        assert_eq!(stats.untagged_frames, 1);
        assert_eq!(stats.messages_routed, 1);
        assert_eq!(stats.live_links, 1);
    }

    #[tokio::test]
    async fn test_link_loss_notifies_and_resubscribe_reopens() {
        let mut h = start(RouterConfig {
            reopen_attempts: 0,
            ..RouterConfig::default()
        });
        let mut a = connect(&h.router, "A", 16).await;
        let mut b = connect(&h.router, "B", 16).await;
        subscribe(&h.router, &mut a, "ETH-USD").await;
        subscribe(&h.router, &mut b, "ETH-USD").await;
        let feed = accept(&mut h.acceptor).await;
        wait_open(&h.router, "ETH-USD").await;

        feed.fail("connection reset");
        assert!(a.expect_status().await.contains("unavailable"));
        assert!(b.expect_status().await.contains("unavailable"));
        assert_eq!(h.router.link_state("ETH-USD").await.unwrap(), None);
        assert_eq!(h.router.subscribers_of("ETH-USD").await.unwrap().len(), 2);

        subscribe(&h.router, &mut a, "ETH-USD").await;
        let feed = accept(&mut h.acceptor).await;
        wait_open(&h.router, "ETH-USD").await;
        feed.push(r#"{"type":"l2update","product_id":"ETH-USD","changes":[]}"#);
        a.expect_data("ETH-USD").await;
        b.expect_data("ETH-USD").await;

        let stats = h.router.stats().await.unwrap();
        assert_eq!(stats.link_failures, 1);
        assert_eq!(stats.live_links, 1);
    }

    #[tokio::test]
    async fn test_link_loss_reopens_within_budget() {
        let mut h = start(RouterConfig::default());
        let mut a = connect(&h.router, "A", 16).await;
        subscribe(&h.router, &mut a, "BTC-USD").await;
        let feed = accept(&mut h.acceptor).await;
        wait_open(&h.router, "BTC-USD").await;

        feed.fail("reset");
        assert!(a.expect_status().await.contains("reconnecting"));
        let feed = accept(&mut h.acceptor).await;
        wait_open(&h.router, "BTC-USD").await;
        feed.push(trade("BTC-USD", "7"));
        assert_eq!(a.expect_data("BTC-USD").await["price"], "7");

        // A link that has delivered restores the budget, so a later loss reopens again.
        feed.fail("reset");
        assert!(a.expect_status().await.contains("reconnecting"));
        accept(&mut h.acceptor).await;
        wait_open(&h.router, "BTC-USD").await;
        assert_eq!(h.connector.attempts("BTC-USD"), 3);
    }

    #[tokio::test]
    async fn test_failed_reopen_leaves_instrument_linkless() {
        let mut h = start(RouterConfig::default());
        let mut a = connect(&h.router, "A", 16).await;
        subscribe(&h.router, &mut a, "BTC-USD").await;
        let feed = accept(&mut h.acceptor).await;
        wait_open(&h.router, "BTC-USD").await;

        h.connector.refuse("BTC-USD");
        feed.fail("reset");
        assert!(a.expect_status().await.contains("reconnecting"));
        assert!(a.expect_status().await.contains("unavailable"));
        assert_eq!(h.router.link_state("BTC-USD").await.unwrap(), None);
        assert!(h.router.subscribers_of("BTC-USD").await.unwrap().contains(&a.id));
        assert_eq!(h.connector.attempts("BTC-USD"), 2);

        h.connector.allow("BTC-USD");
        subscribe(&h.router, &mut a, "BTC-USD").await;
        let feed = accept(&mut h.acceptor).await;
        wait_open(&h.router, "BTC-USD").await;
        feed.push(trade("BTC-USD", "9"));
        assert_eq!(a.expect_data("BTC-USD").await["price"], "9");
    }

    #[tokio::test]
    async fn test_feed_dropping_after_open_exhausts_reopen_budget() {
        let mut h = start(RouterConfig::default());
        let mut a = connect(&h.router, "A", 16).await;
        subscribe(&h.router, &mut a, "BTC-USD").await;

        // The feed accepts the handshake and hangs up before sending anything.
        for _ in 0..2 {
            let feed = accept(&mut h.acceptor).await;
            wait_open(&h.router, "BTC-USD").await;
            drop(feed);
        }

        assert!(a.expect_status().await.contains("reconnecting"));
        assert!(a.expect_status().await.contains("unavailable"));
        assert_eq!(h.router.link_state("BTC-USD").await.unwrap(), None);
        a.assert_quiet().await;
        assert!(h.acceptor.try_accept().is_none());
        assert_eq!(h.connector.attempts("BTC-USD"), 2);
        assert_eq!(h.router.stats().await.unwrap().link_failures, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_links_track_subscribers_under_interleaving() {
        const INSTRUMENTS: [&str; 3] = ["BTC-USD", "ETH-USD", "SOL-USD"];
        let h = start(RouterConfig::default());

        let mut tasks = Vec::new();
        for task in 0..8u64 {
            let router = h.router.clone();
            tasks.push(tokio::spawn(async move {
                let id = SessionId::new(format!("s{task}"));
                let mut inboxes = Vec::new();
                let (outbox, rx) = SessionOutbox::channel(1024);
                router
                    .connect(id.clone(), Principal::new(id.as_str()), outbox)
                    .await
                    .unwrap();
                inboxes.push(rx);

                // Deterministic LCG per task so failures reproduce.
                let mut seed = 0x9e37_79b9_7f4a_7c15_u64.wrapping_add(task);
                let mut next = |bound: u64| {
                    seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                    (seed >> 33) % bound
                };

                for _ in 0..500 {
                    let instrument = INSTRUMENTS[next(INSTRUMENTS.len() as u64) as usize];
                    match next(10) {
                        0..=4 => router.subscribe(id.clone(), instrument).await.unwrap(),
                        5..=8 => router.unsubscribe(id.clone(), instrument).await.unwrap(),
                        _ => {
                            router.disconnect(id.clone()).await.unwrap();
                            let (outbox, rx) = SessionOutbox::channel(1024);
                            router
                                .connect(id.clone(), Principal::new(id.as_str()), outbox)
                                .await
                                .unwrap();
                            inboxes.push(rx);
                        }
                    }
                    if next(4) == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut linked = 0;
        for instrument in INSTRUMENTS {
            let has_link = h.router.link_state(instrument).await.unwrap().is_some();
            let subscribers = h.router.subscribers_of(instrument).await.unwrap();
            assert_eq!(has_link, !subscribers.is_empty(), "{instrument}");
            linked += usize::from(has_link);
        }
        let stats = h.router.stats().await.unwrap();
        assert_eq!(stats.live_links, linked);
        assert_eq!(stats.link_failures, 0);
        assert_eq!(stats.sessions, 8);
    }

    #[tokio::test]
    async fn test_resubscribe_after_last_unsubscribe_uses_fresh_link() {
        let mut h = start(RouterConfig::default());
        let mut a = connect(&h.router, "A", 16).await;
        subscribe(&h.router, &mut a, "SOL-USD").await;
        let mut old = accept(&mut h.acceptor).await;
        wait_open(&h.router, "SOL-USD").await;

        h.router.unsubscribe(a.id.clone(), "SOL-USD").await.unwrap();
        h.router.subscribe(a.id.clone(), "SOL-USD").await.unwrap();
        assert_eq!(a.next().await, ServerFrame::unsubscribed("SOL-USD"));
        assert_eq!(a.next().await, ServerFrame::subscribed("SOL-USD"));
        let new = accept(&mut h.acceptor).await;
        wait_open(&h.router, "SOL-USD").await;
        timeout(WAIT, old.closed()).await.unwrap();

        old.push(trade("SOL-USD", "1"));
        new.push(trade("SOL-USD", "2"));
        assert_eq!(a.expect_data("SOL-USD").await["price"], "2");
        a.assert_quiet().await;

        let stats = h.router.stats().await.unwrap();
        assert_eq!(stats.live_links, 1);
        assert_eq!(h.connector.attempts("SOL-USD"), 2);
    }

    #[tokio::test]
    async fn test_disconnect_closes_emptied_links() {
        let mut h = start(RouterConfig::default());
        let mut a = connect(&h.router, "A", 16).await;
        let mut b = connect(&h.router, "B", 16).await;

        subscribe(&h.router, &mut a, "BTC-USD").await;
        let mut btc = accept(&mut h.acceptor).await;
        subscribe(&h.router, &mut a, "ETH-USD").await;
        let eth = accept(&mut h.acceptor).await;
        subscribe(&h.router, &mut b, "ETH-USD").await;

        h.router.disconnect(a.id.clone()).await.unwrap();
        timeout(WAIT, btc.closed()).await.unwrap();
        assert!(!eth.is_closed());

        let subscribers = h.router.subscribers_of("ETH-USD").await.unwrap();
        assert_eq!(subscribers, HashSet::from([b.id.clone()]));
        let stats = h.router.stats().await.unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.live_links, 1);
        assert_eq!(stats.total_subscriptions, 1);
    }

    #[tokio::test]
    async fn test_rejected_subscriptions_report_errors() {
        let mut h = start(RouterConfig {
            max_subscriptions_per_session: 1,
            ..RouterConfig::default()
        });
        let mut a = connect(&h.router, "A", 16).await;

        let err = h.router.subscribe(a.id.clone(), "").await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidInstrument(_)));
        assert!(matches!(
            a.next().await,
            ServerFrame::Error {
                code: error_codes::INVALID_INSTRUMENT,
                ..
            }
        ));

        subscribe(&h.router, &mut a, "BTC-USD").await;
        let err = h.router.subscribe(a.id.clone(), "ETH-USD").await.unwrap_err();
        assert!(matches!(err, RouterError::MaxSubscriptionsReached));
        assert!(matches!(
            a.next().await,
            ServerFrame::Error {
                code: error_codes::SUBSCRIPTION_LIMIT,
                ..
            }
        ));

        // Re-subscribing to a held instrument is not a new subscription.
        subscribe(&h.router, &mut a, "BTC-USD").await;
        accept(&mut h.acceptor).await;
        settle().await;
        assert!(h.acceptor.try_accept().is_none());
        assert_eq!(h.connector.attempts("ETH-USD"), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_ignored() {
        let h = start(RouterConfig::default());
        let ghost = SessionId::new("ghost");

        let err = h.router.subscribe(ghost.clone(), "BTC-USD").await.unwrap_err();
        assert!(matches!(err, RouterError::UnknownSession(_)));
        assert!(h.router.unsubscribe(ghost.clone(), "BTC-USD").await.is_err());
        h.router.disconnect(ghost).await.unwrap();
        assert_eq!(h.router.stats().await.unwrap(), RouterStats::default());
    }

    #[tokio::test]
    async fn test_unsubscribe_without_subscription_is_acked() {
        let h = start(RouterConfig::default());
        let mut a = connect(&h.router, "A", 16).await;

        h.router.unsubscribe(a.id.clone(), "BTC-USD").await.unwrap();
        assert_eq!(a.next().await, ServerFrame::unsubscribed("BTC-USD"));
        assert_eq!(h.connector.attempts("BTC-USD"), 0);
    }

    #[tokio::test]
    async fn test_slow_session_does_not_block_others() {
        let mut h = start(RouterConfig::default());
        let mut slow = connect(&h.router, "slow", 1).await;
        let mut fast = connect(&h.router, "fast", 16).await;
        let mut gone = connect(&h.router, "gone", 16).await;

        subscribe(&h.router, &mut slow, "BTC-USD").await;
        subscribe(&h.router, &mut fast, "BTC-USD").await;
        subscribe(&h.router, &mut gone, "BTC-USD").await;
        drop(gone.rx);
        let feed = accept(&mut h.acceptor).await;
        wait_open(&h.router, "BTC-USD").await;

        for price in ["1", "2", "3"] {
            feed.push(trade("BTC-USD", price));
        }
        for price in ["1", "2", "3"] {
            assert_eq!(fast.expect_data("BTC-USD").await["price"], price);
        }
        assert_eq!(slow.expect_data("BTC-USD").await["price"], "1");
        slow.assert_quiet().await;

        let stats = h.router.stats().await.unwrap();
        assert_eq!(stats.messages_routed, 3);
        assert_eq!(stats.deliveries, 4);
        assert_eq!(stats.delivery_failures, 5);
    }

    #[tokio::test]
    async fn test_message_reaches_exactly_current_subscribers() {
        let mut h = start(RouterConfig::default());
        let mut clients = Vec::new();
        for i in 0..4 {
            clients.push(connect(&h.router, &format!("s{i}"), 16).await);
        }
        for client in clients.iter_mut().take(3) {
            subscribe(&h.router, client, "ADA-USD").await;
        }
        let feed = accept(&mut h.acceptor).await;
        wait_open(&h.router, "ADA-USD").await;
        h.router.unsubscribe(clients[0].id.clone(), "ADA-USD").await.unwrap();
        clients[0].next().await;

        let expected = h.router.subscribers_of("ADA-USD").await.unwrap();
        feed.push(r#"{"type":"ticker","product_id":"ADA-USD"}"#);
        timeout(WAIT, async {
            while h.router.stats().await.unwrap().messages_routed == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        for client in &mut clients {
            let got = client.rx.try_recv().ok();
            assert_eq!(got.is_some(), expected.contains(&client.id));
            if let Some(frame) = got {
                assert!(matches!(
                    frame.as_ref(),
                    ServerFrame::Data {
                        kind: FeedKind::Other,
                        ..
                    }
                ));
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_links_and_stops() {
        let mut h = start(RouterConfig::default());
        let mut a = connect(&h.router, "A", 16).await;
        subscribe(&h.router, &mut a, "BTC-USD").await;
        let mut feed = accept(&mut h.acceptor).await;

        h.router.shutdown().await;
        timeout(WAIT, feed.closed()).await.unwrap();
        assert!(matches!(
            h.router.stats().await,
            Err(RouterError::Closed)
        ));
        h.router.shutdown().await;
    }
}
