//! Connection state management.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::Shutdown;

use bytes::{Buf, Bytes, BytesMut};
use cohort_types::{ProcessId, handshake};
use mio::net::TcpStream;

use crate::error::{NetError, NetResult};
use crate::event::{ConnectionId, TransportEvent};
use crate::frame;
use crate::tie_break::ConnectionKey;

/// Handshake progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Active side: dialing, then waiting for the peer's identity.
    Connecting,
    /// Passive side: own identity sent, waiting for the peer's.
    Accepting,
    /// Handshake complete; frames may flow.
    Connected,
}

/// Whether the peer is still there after servicing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Liveness {
    Open,
    /// Clean close at a frame boundary.
    Closed,
}

pub(crate) enum Link {
    Tcp(TcpStream),
    /// Self-connection: the outbound slot is handed to `inbox` by the poll
    /// loop instead of a socket.
    Loopback {
        outbound: Option<Bytes>,
        inbox: VecDeque<Bytes>,
    },
}

/// State of one connection to a remote process.
pub struct Connection {
    id: ConnectionId,
    local: ProcessId,
    /// Expected peer on the active side, learned peer on the passive side.
    remote: Option<ProcessId>,
    phase: Phase,
    link: Link,
    key: Option<ConnectionKey>,
    /// The non-blocking dial has completed.
    dialed: bool,
    read_buf: BytesMut,
    write_buf: BytesMut,
    sender_enabled: bool,
    receiver_enabled: bool,
    /// A message was set and has not been fully written yet.
    slot_occupied: bool,
    /// `ReadyForNextMessage` was emitted and not yet answered.
    ready_signalled: bool,
    /// EOF observed; acted on once buffered frames have been drained.
    peer_closed: bool,
    /// Half-close requested: no new messages, write side shut once the
    /// pending one has left.
    closing: bool,
    write_closed: bool,
}

impl Connection {
    fn with_link(
        id: ConnectionId,
        local: ProcessId,
        remote: Option<ProcessId>,
        phase: Phase,
        link: Link,
        buffer_size: usize,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            phase,
            link,
            key: None,
            dialed: false,
            read_buf: BytesMut::with_capacity(buffer_size),
            write_buf: BytesMut::with_capacity(buffer_size),
            sender_enabled: false,
            receiver_enabled: false,
            slot_occupied: false,
            ready_signalled: false,
            peer_closed: false,
            closing: false,
            write_closed: false,
        }
    }

    /// Creates the active side of a connection whose dial is in flight.
    pub(crate) fn dialing(
        id: ConnectionId,
        local: ProcessId,
        remote: ProcessId,
        stream: TcpStream,
        buffer_size: usize,
    ) -> Self {
        Self::with_link(
            id,
            local,
            Some(remote),
            Phase::Connecting,
            Link::Tcp(stream),
            buffer_size,
        )
    }

    /// Creates the passive side of an accepted socket and queues the local
    /// identity, which the passive side sends first.
    pub(crate) fn accepting(
        id: ConnectionId,
        local: ProcessId,
        stream: TcpStream,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let key = ConnectionKey::new(stream.local_addr()?, stream.peer_addr()?);
        let mut conn = Self::with_link(
            id,
            local,
            None,
            Phase::Accepting,
            Link::Tcp(stream),
            buffer_size,
        );
        conn.key = Some(key);
        conn.dialed = true;
        handshake::encode(&conn.local, &mut conn.write_buf);
        Ok(conn)
    }

    /// Creates a self-connection. It is connected from the start.
    pub(crate) fn loopback(id: ConnectionId, local: ProcessId) -> Self {
        let mut conn = Self::with_link(
            id,
            local.clone(),
            Some(local),
            Phase::Connected,
            Link::Loopback {
                outbound: None,
                inbox: VecDeque::new(),
            },
            0,
        );
        conn.dialed = true;
        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> Option<&ProcessId> {
        self.remote.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn key(&self) -> Option<&ConnectionKey> {
        self.key.as_ref()
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.link, Link::Loopback { .. })
    }

    pub fn sender_enabled(&self) -> bool {
        self.sender_enabled
    }

    pub fn receiver_enabled(&self) -> bool {
        self.receiver_enabled
    }

    /// Returns true while a message sits in the outbound slot.
    pub fn has_pending_message(&self) -> bool {
        self.slot_occupied
    }

    /// Returns true once a graceful close has been requested.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.link {
            Link::Tcp(stream) => Some(stream),
            Link::Loopback { .. } => None,
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Places `payload` into the single outbound slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot still holds the previous message.
    pub(crate) fn set_message(&mut self, payload: Bytes, max_frame_size: usize) -> NetResult<()> {
        assert!(
            !self.slot_occupied,
            "message set on {} while the previous one is still pending",
            self.id
        );
        if self.phase != Phase::Connected {
            return Err(NetError::NotConnected(self.id));
        }
        if payload.len() > max_frame_size {
            return Err(NetError::FrameTooLarge {
                len: payload.len(),
                max: max_frame_size,
            });
        }

        match &mut self.link {
            Link::Tcp(_) => frame::encode(&payload, &mut self.write_buf),
            Link::Loopback { outbound, .. } => *outbound = Some(payload),
        }
        self.slot_occupied = true;
        self.ready_signalled = false;
        Ok(())
    }

    pub(crate) fn set_sender_enabled(
        &mut self,
        enabled: bool,
        out: &mut VecDeque<TransportEvent>,
    ) {
        self.sender_enabled = enabled;
        if enabled {
            self.signal_ready(out);
        }
    }

    pub(crate) fn set_receiver_enabled(&mut self, enabled: bool) {
        self.receiver_enabled = enabled;
    }

    /// Stops accepting messages and half-closes once the pending one has
    /// been written. Reading continues until the peer closes too.
    pub(crate) fn begin_close(&mut self) {
        self.closing = true;
        self.sender_enabled = false;
        self.receiver_enabled = true;
    }

    /// Shuts the socket down in both directions. Errors are irrelevant here:
    /// the connection is being dropped either way.
    pub(crate) fn shutdown(&mut self) {
        if let Link::Tcp(stream) = &self.link {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    // ========================================================================
    // I/O
    // ========================================================================

    /// Completes a non-blocking dial.
    ///
    /// Returns `true` once the socket is connected.
    pub(crate) fn finish_dial(&mut self) -> io::Result<bool> {
        if self.dialed {
            return Ok(true);
        }
        let Link::Tcp(stream) = &self.link else {
            return Ok(true);
        };

        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(remote) => {
                self.key = Some(ConnectionKey::new(stream.local_addr()?, remote));
                self.dialed = true;
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Writes data from the write buffer to the socket, and releases the
    /// outbound slot once its frame has left.
    pub(crate) fn flush(&mut self, out: &mut VecDeque<TransportEvent>) -> io::Result<()> {
        match &mut self.link {
            Link::Tcp(stream) => {
                if !self.dialed {
                    return Ok(());
                }
                while !self.write_buf.is_empty() {
                    match stream.write(&self.write_buf) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "failed to write to socket",
                            ));
                        }
                        Ok(n) => {
                            self.write_buf.advance(n);
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Link::Loopback { outbound, inbox } => {
                if let Some(payload) = outbound.take() {
                    inbox.push_back(payload);
                }
            }
        }

        self.slot_occupied = false;
        if self.closing && !self.write_closed {
            if let Link::Tcp(stream) = &self.link {
                stream.shutdown(Shutdown::Write)?;
            }
            self.write_closed = true;
        }
        self.signal_ready(out);
        Ok(())
    }

    /// Reads whatever the link has ready, advances the handshake and emits
    /// received frames while the receiver is started.
    pub(crate) fn process_inbound(
        &mut self,
        max_frame_size: usize,
        out: &mut VecDeque<TransportEvent>,
    ) -> NetResult<Liveness> {
        if let Link::Loopback { inbox, .. } = &mut self.link {
            if self.receiver_enabled {
                out.extend(inbox.drain(..).map(|payload| TransportEvent::Received {
                    connection: self.id,
                    payload,
                }));
            }
            return Ok(Liveness::Open);
        }
        if !self.dialed {
            return Ok(Liveness::Open);
        }

        let wants_read = self.phase != Phase::Connected || self.receiver_enabled;
        if wants_read && !self.peer_closed {
            self.peer_closed = !self.read()?;
        }

        if self.phase != Phase::Connected {
            self.advance_handshake(out)?;
        }

        if self.phase == Phase::Connected && self.receiver_enabled {
            while let Some(payload) = frame::decode(&mut self.read_buf, max_frame_size)? {
                out.push_back(TransportEvent::Received {
                    connection: self.id,
                    payload,
                });
            }
        }

        if self.peer_closed {
            if self.phase != Phase::Connected {
                return Err(NetError::HandshakeIncomplete);
            }
            if self.receiver_enabled {
                if !self.read_buf.is_empty() {
                    return Err(NetError::TruncatedFrame {
                        buffered: self.read_buf.len(),
                    });
                }
                return Ok(Liveness::Closed);
            }
        }
        Ok(Liveness::Open)
    }

    /// Reads data from the socket into the read buffer.
    ///
    /// Returns `true` if the connection is still open.
    fn read(&mut self) -> io::Result<bool> {
        let Link::Tcp(stream) = &mut self.link else {
            return Ok(true);
        };
        // Use a temporary stack buffer to avoid unsafe
        let mut temp_buf = [0u8; 4096];

        loop {
            match stream.read(&mut temp_buf) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&temp_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn advance_handshake(&mut self, out: &mut VecDeque<TransportEvent>) -> NetResult<()> {
        let Some(peer) = handshake::decode(&mut self.read_buf)? else {
            return Ok(());
        };

        match self.phase {
            Phase::Connecting => {
                if self.remote.as_ref() != Some(&peer) {
                    return Err(NetError::HandshakeMismatch {
                        expected: self.remote.clone(),
                        actual: peer,
                    });
                }
                // The active side answers only after verifying the peer.
                handshake::encode(&self.local, &mut self.write_buf);
                self.phase = Phase::Connected;
                out.push_back(TransportEvent::Connected {
                    connection: self.id,
                    remote: peer,
                    key: self.key,
                });
            }
            Phase::Accepting => {
                self.remote = Some(peer.clone());
                self.phase = Phase::Connected;
                if let Some(key) = self.key {
                    out.push_back(TransportEvent::Accepted {
                        connection: self.id,
                        remote: peer,
                        key,
                    });
                }
            }
            Phase::Connected => {}
        }
        self.signal_ready(out);
        Ok(())
    }

    fn signal_ready(&mut self, out: &mut VecDeque<TransportEvent>) {
        if self.phase == Phase::Connected
            && self.sender_enabled
            && !self.closing
            && !self.slot_occupied
            && !self.ready_signalled
        {
            self.ready_signalled = true;
            out.push_back(TransportEvent::ReadyForNextMessage {
                connection: self.id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> Connection {
        Connection::loopback(ConnectionId::new(7), ProcessId::new("127.0.0.1", 7000, 0))
    }

    #[test]
    fn both_directions_start_disabled() {
        let conn = loopback();
        assert!(!conn.sender_enabled());
        assert!(!conn.receiver_enabled());
        assert_eq!(conn.phase(), Phase::Connected);
        assert!(conn.is_loopback());
        assert!(conn.key().is_none());
    }

    #[test]
    fn ready_is_signalled_once_per_free_slot() {
        let mut conn = loopback();
        let mut out = VecDeque::new();

        conn.set_sender_enabled(true, &mut out);
        conn.set_sender_enabled(true, &mut out);
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out.pop_front(),
            Some(TransportEvent::ReadyForNextMessage { .. })
        ));

        conn.set_message(Bytes::from_static(b"m"), 64).unwrap();
        assert!(conn.has_pending_message());
        conn.flush(&mut out).unwrap();
        assert!(!conn.has_pending_message());
        assert!(matches!(
            out.pop_front(),
            Some(TransportEvent::ReadyForNextMessage { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "still pending")]
    fn second_message_before_consumption_panics() {
        let mut conn = loopback();
        conn.set_message(Bytes::from_static(b"first"), 64).unwrap();
        let _ = conn.set_message(Bytes::from_static(b"second"), 64);
    }

    #[test]
    fn loopback_holds_frames_until_receiver_starts() {
        let mut conn = loopback();
        let mut out = VecDeque::new();

        conn.set_message(Bytes::from_static(b"hello"), 64).unwrap();
        conn.flush(&mut out).unwrap();
        assert_eq!(conn.process_inbound(64, &mut out).unwrap(), Liveness::Open);
        assert!(out.is_empty(), "receiver is stopped");

        conn.set_receiver_enabled(true);
        conn.process_inbound(64, &mut out).unwrap();
        assert_eq!(
            out.pop_front(),
            Some(TransportEvent::Received {
                connection: ConnectionId::new(7),
                payload: Bytes::from_static(b"hello"),
            })
        );
    }

    #[test]
    fn oversized_message_is_rejected_without_occupying_slot() {
        let mut conn = loopback();
        assert!(matches!(
            conn.set_message(Bytes::from(vec![0u8; 65]), 64),
            Err(NetError::FrameTooLarge { len: 65, max: 64 })
        ));
        assert!(!conn.has_pending_message());
    }
}
