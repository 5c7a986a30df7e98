//! Single-client enforcement driven by control-channel connection events.

use crate::transport::{ConnectionEvent, EventKind, PeerId};
use std::collections::HashMap;

/// Per-peer standing with the server. A disconnected peer has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The primary client; the only peer allowed to drive the sensor.
    Connected,
    /// A secondary peer, answered with a rejection until it leaves.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    NoClient,
    OneClient,
}

/// What a single event changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    PrimaryAttached(PeerId),
    SecondaryRejected(PeerId),
    SecondaryLeft(PeerId),
    /// The primary left and its session was torn down.
    PrimaryLost(PeerId),
}

/// Cleanup run when the primary client disappears.
pub trait SessionTeardown {
    fn teardown_client(&mut self);
}

impl SessionTeardown for crate::session::ServerSession {
    fn teardown_client(&mut self) {
        crate::session::ServerSession::teardown_client(self);
    }
}

#[derive(Debug, Default)]
pub struct ConnectionSupervisor {
    peers: HashMap<PeerId, ConnectionState>,
    primary: Option<PeerId>,
    rejected: u64,
    retries: u64,
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ClientState {
        if self.primary.is_some() {
            ClientState::OneClient
        } else {
            ClientState::NoClient
        }
    }

    pub fn primary(&self) -> Option<PeerId> {
        self.primary
    }

    /// Standing of `peer`; `None` if no event for it has been seen yet.
    pub fn role(&self, peer: PeerId) -> Option<ConnectionState> {
        self.peers.get(&peer).copied()
    }

    /// Number of peers currently in `Connected` state. Never above one.
    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|&&s| s == ConnectionState::Connected)
            .count()
    }

    /// Secondary peers turned away so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn handle(
        &mut self,
        event: &ConnectionEvent,
        session: &mut dyn SessionTeardown,
    ) -> Transition {
        match event.kind {
            EventKind::Accepted => self.attach(event.peer),
            // Connected without a prior Accepted happens when the mask hides
            // Accepted events.
            EventKind::Connected => {
                if self.peers.contains_key(&event.peer) {
                    log::debug!("Peer {} connected", event.peer);
                    Transition::Unchanged
                } else {
                    self.attach(event.peer)
                }
            }
            EventKind::Disconnected | EventKind::Closed => {
                self.detach(event.peer, event.kind, session)
            }
            EventKind::ConnectRetried => {
                self.retries += 1;
                log::info!("Control listener retrying accept");
                Transition::Unchanged
            }
        }
    }

    fn attach(&mut self, peer: PeerId) -> Transition {
        match self.primary {
            None => {
                self.primary = Some(peer);
                self.peers.insert(peer, ConnectionState::Connected);
                log::info!("Client {} connected", peer);
                Transition::PrimaryAttached(peer)
            }
            Some(primary) if primary == peer => Transition::Unchanged,
            Some(primary) => {
                self.peers.insert(peer, ConnectionState::Busy);
                self.rejected += 1;
                log::warn!(
                    "Peer {} rejected: client {} already connected",
                    peer,
                    primary
                );
                Transition::SecondaryRejected(peer)
            }
        }
    }

    fn detach(
        &mut self,
        peer: PeerId,
        kind: EventKind,
        session: &mut dyn SessionTeardown,
    ) -> Transition {
        let previous = self.peers.remove(&peer);
        if self.primary == Some(peer) {
            self.primary = None;
            log::info!("Client {} {:?}; releasing the sensor", peer, kind);
            session.teardown_client();
            return Transition::PrimaryLost(peer);
        }
        match previous {
            Some(_) => {
                log::debug!("Secondary peer {} {:?}", peer, kind);
                Transition::SecondaryLeft(peer)
            }
            None => Transition::Unchanged,
        }
    }

    /// Forget every peer, tearing down the session if a client was attached.
    pub fn reset(&mut self, session: &mut dyn SessionTeardown) {
        if let Some(primary) = self.primary.take() {
            log::info!("Dropping client {}", primary);
            session.teardown_client();
        }
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        teardowns: usize,
    }

    impl SessionTeardown for Recorder {
        fn teardown_client(&mut self) {
            self.teardowns += 1;
        }
    }

    fn event(peer: PeerId, kind: EventKind) -> ConnectionEvent {
        ConnectionEvent {
            peer,
            kind,
            addr: None,
        }
    }

    #[test]
    fn test_first_peer_becomes_primary() {
        let mut supervisor = ConnectionSupervisor::new();
        let mut session = Recorder::default();
        assert_eq!(supervisor.state(), ClientState::NoClient);
        assert_eq!(
            supervisor.handle(&event(1, EventKind::Accepted), &mut session),
            Transition::PrimaryAttached(1)
        );
        assert_eq!(supervisor.state(), ClientState::OneClient);
        assert_eq!(supervisor.role(1), Some(ConnectionState::Connected));
    }

    #[test]
    fn test_second_peer_is_rejected_without_disturbing_first() {
        let mut supervisor = ConnectionSupervisor::new();
        let mut session = Recorder::default();
        supervisor.handle(&event(1, EventKind::Accepted), &mut session);
        assert_eq!(
            supervisor.handle(&event(2, EventKind::Accepted), &mut session),
            Transition::SecondaryRejected(2)
        );
        assert_eq!(supervisor.primary(), Some(1));
        assert_eq!(supervisor.role(2), Some(ConnectionState::Busy));

        supervisor.handle(&event(2, EventKind::Disconnected), &mut session);
        assert_eq!(session.teardowns, 0);
        assert_eq!(supervisor.primary(), Some(1));
        assert_eq!(supervisor.role(2), None);
    }

    #[test]
    fn test_primary_loss_tears_down_session() {
        let mut supervisor = ConnectionSupervisor::new();
        let mut session = Recorder::default();
        supervisor.handle(&event(1, EventKind::Accepted), &mut session);
        supervisor.handle(&event(2, EventKind::Accepted), &mut session);
        assert_eq!(
            supervisor.handle(&event(1, EventKind::Closed), &mut session),
            Transition::PrimaryLost(1)
        );
        assert_eq!(session.teardowns, 1);
        assert_eq!(supervisor.state(), ClientState::NoClient);

        // The waiting secondary must reconnect to be promoted.
        assert_eq!(supervisor.role(2), Some(ConnectionState::Busy));
        supervisor.handle(&event(3, EventKind::Accepted), &mut session);
        assert_eq!(supervisor.primary(), Some(3));
    }

    #[test]
    fn test_at_most_one_connected_for_any_sequence() {
        let mut supervisor = ConnectionSupervisor::new();
        let mut session = Recorder::default();
        let kinds = [
            EventKind::Accepted,
            EventKind::Connected,
            EventKind::Disconnected,
            EventKind::Closed,
            EventKind::ConnectRetried,
        ];
        // Deterministic pseudo-random walk over peers and event kinds.
        let mut x: u32 = 12345;
        for _ in 0..2000 {
            x = x.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let peer = u64::from((x >> 8) % 5) + 1;
            let kind = kinds[((x >> 16) % kinds.len() as u32) as usize];
            supervisor.handle(&event(peer, kind), &mut session);
            assert!(supervisor.connected_count() <= 1);
            assert_eq!(
                supervisor.connected_count() == 1,
                supervisor.state() == ClientState::OneClient
            );
        }
    }

    #[test]
    fn test_connected_without_accepted_attaches() {
        let mut supervisor = ConnectionSupervisor::new();
        let mut session = Recorder::default();
        assert_eq!(
            supervisor.handle(&event(7, EventKind::Connected), &mut session),
            Transition::PrimaryAttached(7)
        );
        assert_eq!(
            supervisor.handle(&event(7, EventKind::Connected), &mut session),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_retries_and_reset() {
        let mut supervisor = ConnectionSupervisor::new();
        let mut session = Recorder::default();
        supervisor.handle(&event(0, EventKind::ConnectRetried), &mut session);
        assert_eq!(supervisor.retries(), 1);
        supervisor.handle(&event(1, EventKind::Accepted), &mut session);
        supervisor.reset(&mut session);
        assert_eq!(session.teardowns, 1);
        assert_eq!(supervisor.state(), ClientState::NoClient);
    }
}
