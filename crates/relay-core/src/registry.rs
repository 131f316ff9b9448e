//! Subscription registry.
//!
//! Tracks which sessions listen to which instruments, in both directions. The
//! registry itself is not synchronized: it is owned by the router actor, which
//! is the only place subscriptions change.

use std::collections::{HashMap, HashSet};

use crate::instrument::InstrumentId;
use crate::session::SessionId;

/// Bidirectional subscription map.
///
/// Invariant: a session appears under an instrument iff the instrument appears
/// under the session. Empty sets are never stored.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// Instrument -> subscribed sessions.
    by_instrument: HashMap<InstrumentId, HashSet<SessionId>>,
    /// Session -> subscribed instruments.
    by_session: HashMap<SessionId, HashSet<InstrumentId>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription.
    ///
    /// Returns `true` if the session is the instrument's first subscriber.
    /// Re-adding an existing pair is a no-op returning `false`.
    pub fn add(&mut self, session: &SessionId, instrument: &str) -> bool {
        let subscribers = self
            .by_instrument
            .entry(instrument.to_string())
            .or_default();
        let first = subscribers.is_empty();

        if !subscribers.insert(session.clone()) {
            return false;
        }

        self.by_session
            .entry(session.clone())
            .or_default()
            .insert(instrument.to_string());

        first
    }

    /// Remove a subscription.
    ///
    /// Returns `true` if no subscribers remain for the instrument. Removing a
    /// pair that does not exist is a no-op returning `false`.
    pub fn remove(&mut self, session: &SessionId, instrument: &str) -> bool {
        let Some(instruments) = self.by_session.get_mut(session) else {
            return false;
        };
        if !instruments.remove(instrument) {
            return false;
        }
        if instruments.is_empty() {
            self.by_session.remove(session);
        }

        self.detach(session, instrument)
    }

    /// Remove a session from every instrument.
    ///
    /// Returns the instruments left without subscribers.
    pub fn remove_session(&mut self, session: &SessionId) -> HashSet<InstrumentId> {
        let Some(instruments) = self.by_session.remove(session) else {
            return HashSet::new();
        };

        instruments
            .into_iter()
            .filter(|instrument| self.detach(session, instrument))
            .collect()
    }

    /// Snapshot of the sessions subscribed to an instrument.
    #[must_use]
    pub fn subscribers_of(&self, instrument: &str) -> HashSet<SessionId> {
        self.by_instrument
            .get(instrument)
            .cloned()
            .unwrap_or_default()
    }

    /// Iterate the sessions subscribed to an instrument without copying.
    pub fn subscribers(&self, instrument: &str) -> impl Iterator<Item = &SessionId> {
        self.by_instrument.get(instrument).into_iter().flatten()
    }

    /// Snapshot of the instruments a session is subscribed to.
    #[must_use]
    pub fn instruments_of(&self, session: &SessionId) -> HashSet<InstrumentId> {
        self.by_session.get(session).cloned().unwrap_or_default()
    }

    /// Check whether a session is subscribed to an instrument.
    #[must_use]
    pub fn is_subscribed(&self, session: &SessionId, instrument: &str) -> bool {
        self.by_session
            .get(session)
            .is_some_and(|instruments| instruments.contains(instrument))
    }

    /// Number of sessions subscribed to an instrument.
    #[must_use]
    pub fn subscriber_count(&self, instrument: &str) -> usize {
        self.by_instrument.get(instrument).map_or(0, HashSet::len)
    }

    /// Number of instruments a session is subscribed to.
    #[must_use]
    pub fn subscription_count(&self, session: &SessionId) -> usize {
        self.by_session.get(session).map_or(0, HashSet::len)
    }

    /// Number of instruments with at least one subscriber.
    #[must_use]
    pub fn instrument_count(&self) -> usize {
        self.by_instrument.len()
    }

    /// Number of sessions with at least one subscription.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.by_session.len()
    }

    /// Total number of (session, instrument) pairs.
    #[must_use]
    pub fn total_subscriptions(&self) -> usize {
        self.by_session.values().map(HashSet::len).sum()
    }

    /// Instruments with at least one subscriber.
    #[must_use]
    pub fn instruments(&self) -> Vec<InstrumentId> {
        self.by_instrument.keys().cloned().collect()
    }

    /// Check that both directions agree and no empty sets are stored.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let forward_ok = self.by_instrument.iter().all(|(instrument, sessions)| {
            !sessions.is_empty()
                && sessions.iter().all(|session| {
                    self.by_session
                        .get(session)
                        .is_some_and(|instruments| instruments.contains(instrument))
                })
        });
        let backward_ok = self.by_session.iter().all(|(session, instruments)| {
            !instruments.is_empty()
                && instruments.iter().all(|instrument| {
                    self.by_instrument
                        .get(instrument)
                        .is_some_and(|sessions| sessions.contains(session))
                })
        });
        forward_ok && backward_ok
    }

    /// Drop the instrument -> session edge. Returns `true` if the instrument
    /// has no subscribers left.
    fn detach(&mut self, session: &SessionId, instrument: &str) -> bool {
        let Some(subscribers) = self.by_instrument.get_mut(instrument) else {
            return false;
        };
        subscribers.remove(session);
        if subscribers.is_empty() {
            self.by_instrument.remove(instrument);
            true
        } else {
            false
        }
    }
}
