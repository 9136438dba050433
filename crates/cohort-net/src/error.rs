//! Transport error types.

use std::io;
use std::net::SocketAddr;

use cohort_types::{ProcessId, TypesError};
use thiserror::Error;

use crate::event::ConnectionId;

/// Result type for transport operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur in the connection substrate.
///
/// Errors raised while servicing an established connection never escape
/// [`Transport::poll`](crate::Transport::poll); they tear the connection down
/// and are reported as [`TransportEvent::Broken`](crate::TransportEvent::Broken).
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed { addr: SocketAddr, source: io::Error },

    /// Address resolution failed.
    #[error("failed to resolve {pid}: {source}")]
    Resolve { pid: ProcessId, source: io::Error },

    /// Resolution succeeded but produced no socket address.
    #[error("no socket address for {0}")]
    Unresolvable(ProcessId),

    /// Malformed handshake bytes.
    #[error("handshake decode error: {0}")]
    Handshake(#[from] TypesError),

    /// The peer announced an identity other than the one dialed.
    #[error("handshake identity mismatch: expected {expected:?}, got {actual}")]
    HandshakeMismatch {
        expected: Option<ProcessId>,
        actual: ProcessId,
    },

    /// The peer closed before the handshake completed.
    #[error("peer closed during handshake")]
    HandshakeIncomplete,

    /// Frame length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// The peer closed in the middle of a frame.
    #[error("peer closed mid-frame with {buffered} bytes buffered")]
    TruncatedFrame { buffered: usize },

    /// The connection has not finished its handshake.
    #[error("connection {0} is not established")]
    NotConnected(ConnectionId),

    /// No such connection (already closed, broken or never created).
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}
