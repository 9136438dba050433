//! # cohort-net: Connection substrate for `Cohort`
//!
//! This crate provides the reliable, ordered, length-prefixed byte channel
//! that the protocol layers fan their point-to-point sends out over.
//!
//! ## Architecture
//!
//! The transport uses `mio` for non-blocking I/O with a poll-based event
//! loop. There is no async runtime and no thread per connection: every
//! connection is a small state machine advanced by readiness events, and
//! every liveness transition comes out of [`Transport::poll`] as a
//! [`TransportEvent`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         cohort-net                           │
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────────┐  │
//! │  │  Server    │ → │ Connections  │ → │  TransportEvent    │  │
//! │  │  (listen)  │   │ (handshake,  │   │  (Accepted, Recv,  │  │
//! │  │            │   │  framing)    │   │   Broken, ...)     │  │
//! │  └────────────┘   └──────────────┘   └────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection lifecycle
//!
//! - **Active open**: [`Transport::connect`] dials, reads the peer identity,
//!   verifies it against the expected [`ProcessId`], then sends its own.
//! - **Passive open**: the server accepts, sends the local identity, then
//!   reads the peer's.
//! - **Self-connection**: connecting to the local identity creates a
//!   loopback connection with no socket.
//!
//! Once established, a connection moves framed payloads only while its
//! sender/receiver are started. The outbound side holds a single message at
//! a time; [`TransportEvent::ReadyForNextMessage`] asks for the next one.
//!
//! [`ProcessId`]: cohort_types::ProcessId

mod connection;
mod error;
mod event;
pub mod frame;
mod server;
pub mod tie_break;
mod transport;


pub use connection::{Connection, Phase};
pub use error::{NetError, NetResult};
pub use event::{ConnectionId, TransportEvent};
pub use server::Server;
pub use tie_break::{ConnectionKey, TieBreak, tie_break};
pub use transport::{Transport, TransportConfig};
