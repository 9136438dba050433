//! Process-to-connection routing.
//!
//! The layers address processes; the transport addresses connections. The
//! peer table maps one onto the other, keeps a per-process outbox while no
//! connection can take a message, and feeds the transport's single outbound
//! slot each time it asks for the next message.
//!
//! # Who dials
//!
//! When the layers announce a process, the lower identity dials. A process
//! with messages queued for a peer it has no connection to dials regardless.
//! If both ends dial at once, each ends up with two connections for the same
//! peer; both keep the one [`tie_break`] picks and gracefully close the
//! other, so nothing already written on it is lost.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use cohort_net::{ConnectionId, ConnectionKey, NetError, TieBreak, Transport, tie_break};
use cohort_types::ProcessId;
use tracing::{debug, error, info, trace, warn};

use crate::events::StackEvent;

/// The connection a process is reached over.
#[derive(Debug)]
struct Link {
    connection: ConnectionId,
    /// `None` for the loopback self-connection.
    key: Option<ConnectionKey>,
    /// The transport asked for a message and has not been given one.
    ready: bool,
    /// Last message handed to the transport, kept until the slot frees.
    in_flight: Option<Bytes>,
}

#[derive(Debug, Default)]
struct Peer {
    link: Option<Link>,
    /// Active open whose handshake has not completed.
    dialing: Option<ConnectionId>,
    outbox: VecDeque<Bytes>,
}

impl Peer {
    fn is_reachable(&self) -> bool {
        self.link.is_some() || self.dialing.is_some()
    }
}

/// Routes payloads addressed to processes onto connections.
#[derive(Debug)]
pub(crate) struct PeerTable {
    local: ProcessId,
    peers: HashMap<ProcessId, Peer>,
    connections: HashMap<ConnectionId, ProcessId>,
}

impl PeerTable {
    pub(crate) fn new(local: ProcessId) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    // ========================================================================
    // Layer-facing
    // ========================================================================

    /// Makes sure `pid` is, or will be, connected.
    ///
    /// Dials only if this process has the lower identity, or if messages are
    /// already waiting for `pid`. The self-connection is always opened here.
    pub(crate) fn ensure(&mut self, pid: &ProcessId, transport: &mut Transport) {
        let local_dials = self.local <= *pid;
        let peer = self.peers.entry(pid.clone()).or_default();
        if peer.is_reachable() {
            return;
        }
        if local_dials || !peer.outbox.is_empty() {
            Self::dial(&mut self.connections, peer, pid, transport);
        }
    }

    /// Queues `payload` for `pid` and hands it to the transport as soon as
    /// the connection is ready.
    pub(crate) fn send(&mut self, pid: &ProcessId, payload: Bytes, transport: &mut Transport) {
        let peer = self.peers.entry(pid.clone()).or_default();
        peer.outbox.push_back(payload);
        if !peer.is_reachable() {
            Self::dial(&mut self.connections, peer, pid, transport);
        }
        Self::pump(pid, peer, transport);
    }

    /// Drops every connection to `pid` and whatever was queued for it.
    pub(crate) fn forget(&mut self, pid: &ProcessId, transport: &mut Transport) {
        let Some(peer) = self.peers.remove(pid) else {
            return;
        };
        let connections = peer
            .link
            .iter()
            .map(|l| l.connection)
            .chain(peer.dialing);
        for connection in connections {
            self.connections.remove(&connection);
            if let Err(e) = transport.disconnect(connection) {
                trace!(connection = %connection, error = %e, "already gone");
            }
        }
        info!(pid = %pid, dropped = peer.outbox.len(), "peer forgotten");
    }

    // ========================================================================
    // Transport-facing
    // ========================================================================

    /// A connection to `remote` completed its handshake.
    pub(crate) fn on_established(
        &mut self,
        connection: ConnectionId,
        remote: ProcessId,
        key: Option<ConnectionKey>,
        transport: &mut Transport,
        events: &mut Vec<StackEvent>,
    ) {
        let peer = self.peers.entry(remote.clone()).or_default();
        if peer.dialing == Some(connection) {
            peer.dialing = None;
        }

        let first = peer.link.is_none();
        let decision = peer
            .link
            .as_ref()
            .map(|existing| (existing.connection, tie_break(existing.key.as_ref(), key.as_ref())));
        match decision {
            None => {}
            Some((kept, TieBreak::KeepFirst | TieBreak::Tied)) => {
                debug!(remote = %remote, kept = %kept, closed = %connection, "duplicate connection");
                self.connections.insert(connection, remote);
                Self::retire(connection, transport);
                return;
            }
            Some((closed, TieBreak::KeepSecond)) => {
                debug!(remote = %remote, kept = %connection, closed = %closed, "duplicate connection");
                peer.link = None;
                Self::retire(closed, transport);
            }
        }

        self.connections.insert(connection, remote.clone());
        peer.link = Some(Link {
            connection,
            key,
            ready: false,
            in_flight: None,
        });
        let started = transport
            .start_receiver(connection)
            .and_then(|()| transport.start_sender(connection));
        if let Err(e) = started {
            warn!(connection = %connection, error = %e, "failed to start connection");
            return;
        }

        if first {
            info!(remote = %remote, connection = %connection, queued = peer.outbox.len(), "peer up");
            events.push(StackEvent::PeerUp(remote));
        }
    }

    /// The transport's outbound slot on `connection` is free.
    pub(crate) fn on_ready(&mut self, connection: ConnectionId, transport: &mut Transport) {
        let Some(pid) = self.connections.get(&connection) else {
            return;
        };
        let Some(peer) = self.peers.get_mut(pid) else {
            return;
        };
        if let Some(link) = peer.link.as_mut().filter(|l| l.connection == connection) {
            link.ready = true;
            link.in_flight = None;
        }
        Self::pump(pid, peer, transport);
    }

    /// `connection` closed or broke.
    ///
    /// The message that was being written is put back at the head of the
    /// outbox; the layers discard it if it did arrive. Nothing is redialed
    /// here.
    pub(crate) fn on_lost(
        &mut self,
        connection: ConnectionId,
        remote: Option<ProcessId>,
        reason: &str,
        events: &mut Vec<StackEvent>,
    ) {
        let pid = match self.connections.remove(&connection).or(remote) {
            Some(pid) => pid,
            None => {
                trace!(connection = %connection, "lost connection that never identified");
                return;
            }
        };
        let Some(peer) = self.peers.get_mut(&pid) else {
            return;
        };

        if peer.dialing == Some(connection) {
            peer.dialing = None;
            warn!(remote = %pid, reason, queued = peer.outbox.len(), "dial failed");
            return;
        }

        let Some(link) = peer.link.take_if(|l| l.connection == connection) else {
            trace!(remote = %pid, connection = %connection, "retired duplicate finished");
            return;
        };
        if let Some(payload) = link.in_flight {
            peer.outbox.push_front(payload);
        }
        warn!(remote = %pid, connection = %connection, reason, queued = peer.outbox.len(), "peer down");
        events.push(StackEvent::PeerDown {
            pid,
            reason: reason.to_string(),
        });
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// The process on the other end of `connection`, once identified.
    pub(crate) fn pid_of(&self, connection: ConnectionId) -> Option<&ProcessId> {
        self.connections.get(&connection)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn dial(
        connections: &mut HashMap<ConnectionId, ProcessId>,
        peer: &mut Peer,
        pid: &ProcessId,
        transport: &mut Transport,
    ) {
        let connection = transport.connect(pid.clone());
        debug!(remote = %pid, connection = %connection, "dialing peer");
        connections.insert(connection, pid.clone());
        peer.dialing = Some(connection);
    }

    /// Closes the losing duplicate without dropping what is already in
    /// flight on it; frames still arriving on it are routed as usual until
    /// the peer closes its end.
    fn retire(connection: ConnectionId, transport: &mut Transport) {
        if let Err(e) = transport.close(connection) {
            trace!(connection = %connection, error = %e, "already gone");
        }
    }

    fn pump(pid: &ProcessId, peer: &mut Peer, transport: &mut Transport) {
        let Some(link) = peer.link.as_mut().filter(|l| l.ready) else {
            return;
        };
        while let Some(payload) = peer.outbox.pop_front() {
            match transport.set_message_to_send(link.connection, payload.clone()) {
                Ok(()) => {
                    trace!(remote = %pid, len = payload.len(), "message handed to transport");
                    link.ready = false;
                    link.in_flight = Some(payload);
                    return;
                }
                Err(e @ NetError::FrameTooLarge { .. }) => {
                    error!(remote = %pid, error = %e, "dropping oversized message");
                }
                Err(e) => {
                    // The connection is gone; its Closed/Broken event follows.
                    warn!(remote = %pid, connection = %link.connection, error = %e, "failed to hand message to transport");
                    peer.outbox.push_front(payload);
                    link.ready = false;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use cohort_net::{TransportConfig, TransportEvent};

    use super::*;

    struct Side {
        transport: Transport,
        peers: PeerTable,
        events: Vec<StackEvent>,
        received: Vec<(ProcessId, Bytes)>,
    }

    impl Side {
        fn bind(incarnation: u32) -> Self {
            let transport = Transport::bind(
                ProcessId::new("127.0.0.1", 0, incarnation),
                TransportConfig::default(),
            )
            .unwrap();
            let peers = PeerTable::new(transport.local_pid().clone());
            Self {
                transport,
                peers,
                events: Vec::new(),
                received: Vec::new(),
            }
        }

        fn pid(&self) -> ProcessId {
            self.transport.local_pid().clone()
        }

        fn poll(&mut self) {
            let mut raw = Vec::new();
            self.transport
                .poll(&mut raw, Some(Duration::from_millis(5)))
                .unwrap();
            for event in raw {
                match event {
                    TransportEvent::Accepted {
                        connection,
                        remote,
                        key,
                    } => self.peers.on_established(
                        connection,
                        remote,
                        Some(key),
                        &mut self.transport,
                        &mut self.events,
                    ),
                    TransportEvent::Connected {
                        connection,
                        remote,
                        key,
                    } => self.peers.on_established(
                        connection,
                        remote,
                        key,
                        &mut self.transport,
                        &mut self.events,
                    ),
                    TransportEvent::Closed { connection, remote } => {
                        self.peers
                            .on_lost(connection, remote, "closed", &mut self.events);
                    }
                    TransportEvent::Broken {
                        connection,
                        remote,
                        reason,
                    } => self
                        .peers
                        .on_lost(connection, remote, &reason, &mut self.events),
                    TransportEvent::Received {
                        connection,
                        payload,
                    } => {
                        let source = self.peers.pid_of(connection).cloned().unwrap();
                        self.received.push((source, payload));
                    }
                    TransportEvent::ReadyForNextMessage { connection } => {
                        self.peers.on_ready(connection, &mut self.transport);
                    }
                }
            }
        }
    }

    fn pump(a: &mut Side, b: &mut Side, mut done: impl FnMut(&Side, &Side) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(a, b) {
            assert!(Instant::now() < deadline, "timed out");
            a.poll();
            b.poll();
        }
    }

    fn payloads(side: &Side) -> Vec<&[u8]> {
        side.received.iter().map(|(_, p)| p.as_ref()).collect()
    }

    #[test]
    fn crossing_dials_settle_on_one_connection_without_losing_frames() {
        let mut a = Side::bind(1);
        let mut b = Side::bind(2);
        let (pa, pb) = (a.pid(), b.pid());

        // Both have data queued, so both dial and each ends up with two
        // connections to the other.
        a.peers
            .send(&pb, Bytes::from_static(b"a1"), &mut a.transport);
        b.peers
            .send(&pa, Bytes::from_static(b"b1"), &mut b.transport);
        pump(&mut a, &mut b, |a, b| {
            a.received.len() == 1
                && b.received.len() == 1
                && a.transport.connection_count() == 1
                && b.transport.connection_count() == 1
        });

        a.peers
            .send(&pb, Bytes::from_static(b"a2"), &mut a.transport);
        b.peers
            .send(&pa, Bytes::from_static(b"b2"), &mut b.transport);
        pump(&mut a, &mut b, |a, b| a.received.len() == 2 && b.received.len() == 2);

        assert_eq!(payloads(&b), vec![&b"a1"[..], &b"a2"[..]]);
        assert_eq!(payloads(&a), vec![&b"b1"[..], &b"b2"[..]]);
        assert!(a.received.iter().all(|(source, _)| *source == pb));
        assert!(b.received.iter().all(|(source, _)| *source == pa));

        for side in [&a, &b] {
            let ups = side
                .events
                .iter()
                .filter(|e| matches!(e, StackEvent::PeerUp(_)))
                .count();
            assert_eq!(ups, 1);
            assert!(
                !side
                    .events
                    .iter()
                    .any(|e| matches!(e, StackEvent::PeerDown { .. })),
                "retiring a duplicate is not a peer failure"
            );
        }
    }
}
