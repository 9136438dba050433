//! Connection handles and the events the transport reports.

use std::fmt::Display;

use bytes::Bytes;
use cohort_types::ProcessId;
use mio::Token;

use crate::tie_break::ConnectionKey;

/// Opaque handle of one connection.
///
/// Handles are never reused within a transport, so a stale handle held after
/// a `Closed`/`Broken` event simply fails with
/// [`NetError::UnknownConnection`](crate::NetError::UnknownConnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        Self(token.0 as u64)
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Liveness and data notifications produced by [`Transport::poll`].
///
/// [`Transport::poll`]: crate::Transport::poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A passively opened connection completed its handshake.
    Accepted {
        connection: ConnectionId,
        remote: ProcessId,
        key: ConnectionKey,
    },

    /// An actively opened connection completed its handshake.
    ///
    /// `key` is `None` for the loopback self-connection.
    Connected {
        connection: ConnectionId,
        remote: ProcessId,
        key: Option<ConnectionKey>,
    },

    /// The peer closed cleanly at a frame boundary.
    Closed {
        connection: ConnectionId,
        remote: Option<ProcessId>,
    },

    /// The connection failed: dial error, I/O error, handshake mismatch or
    /// protocol violation. `remote` is the expected or learned peer, if any.
    Broken {
        connection: ConnectionId,
        remote: Option<ProcessId>,
        reason: String,
    },

    /// A complete frame arrived on a connection whose receiver is started.
    Received {
        connection: ConnectionId,
        payload: Bytes,
    },

    /// The outbound slot is free and the sender is started.
    ReadyForNextMessage { connection: ConnectionId },
}

impl TransportEvent {
    /// Returns the connection this event concerns.
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::Accepted { connection, .. }
            | Self::Connected { connection, .. }
            | Self::Closed { connection, .. }
            | Self::Broken { connection, .. }
            | Self::Received { connection, .. }
            | Self::ReadyForNextMessage { connection } => *connection,
        }
    }
}
