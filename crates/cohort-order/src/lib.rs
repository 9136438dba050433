//! # cohort-order: Delivery ordering layers
//!
//! Two pure state machines sit between the application and the transport:
//!
//! - [`fifo::FifoLayer`]: messages from one sender are delivered in the order
//!   that sender sent them, regardless of network reordering.
//! - [`causal::CausalLayer`]: delivery respects happens-before, enforced by
//!   point-to-point fan-out plus acknowledgement gating.
//!
//! Neither layer performs I/O. Every operation returns an [`OrderOutput`]
//! listing the point-to-point packets to send, the payloads to deliver
//! upward and the directives for the transport. The runtime executes it.

use bytes::Bytes;
use cohort_types::{CausalId, ProcessId};
use serde::{Deserialize, Serialize};

pub mod causal;
mod error;
pub mod fifo;

#[cfg(test)]
mod tests;

pub use causal::{CausalConfig, CausalLayer, CausalRequest, CausalStats};
pub use error::{CausalError, OrderError, OrderResult};
pub use fifo::{FifoConfig, FifoLayer, FifoStats};

// ============================================================================
// Wire Packets
// ============================================================================

/// Point-to-point packet of the FIFO layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoPacket {
    /// Position in the sender's stream to this destination.
    pub sequence: u64,
    pub payload: Bytes,
}

/// Point-to-point packet of the causal layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CausalPacket {
    /// The message itself, with the full destination list so receivers know
    /// whom to acknowledge to.
    Send {
        id: CausalId,
        destinations: Vec<ProcessId>,
        payload: Bytes,
    },
    /// "I have delivered `id`."
    Ack { id: CausalId },
}

// ============================================================================
// Layer Output
// ============================================================================

/// One packet addressed to one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing<P> {
    pub destination: ProcessId,
    pub packet: P,
}

/// A payload released to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The process that originally sent the payload.
    pub source: ProcessId,
    pub payload: Bytes,
}

/// Instructions for the transport underneath a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// The layer now talks to exactly these processes; connections to them
    /// should exist.
    Members(Vec<ProcessId>),
}

/// Output produced by an ordering layer.
///
/// The caller (runtime) is responsible for:
/// 1. Sending every packet in `sends` point-to-point
/// 2. Handing `delivered` to the application, in order
/// 3. Applying `directives` to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderOutput<P> {
    pub sends: Vec<Outgoing<P>>,
    pub delivered: Vec<Delivery>,
    pub directives: Vec<Directive>,
    /// Own causal messages acknowledged by every destination. Always empty
    /// for the FIFO layer.
    pub completed: Vec<CausalId>,
}

impl<P> Default for OrderOutput<P> {
    fn default() -> Self {
        Self {
            sends: Vec::new(),
            delivered: Vec::new(),
            directives: Vec::new(),
            completed: Vec::new(),
        }
    }
}

impl<P> OrderOutput<P> {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
            && self.delivered.is_empty()
            && self.directives.is_empty()
            && self.completed.is_empty()
    }

    /// Merges another output into this one, preserving order.
    pub fn merge(&mut self, other: OrderOutput<P>) {
        self.sends.extend(other.sends);
        self.delivered.extend(other.delivered);
        self.directives.extend(other.directives);
        self.completed.extend(other.completed);
    }

    pub(crate) fn send(&mut self, destination: ProcessId, packet: P) {
        self.sends.push(Outgoing {
            destination,
            packet,
        });
    }

    pub(crate) fn deliver(&mut self, source: ProcessId, payload: Bytes) {
        self.delivered.push(Delivery { source, payload });
    }
}

/// Removes repeated processes, keeping the first occurrence of each.
pub(crate) fn dedup_preserving_order(processes: &[ProcessId]) -> Vec<ProcessId> {
    let mut unique: Vec<ProcessId> = Vec::with_capacity(processes.len());
    for pid in processes {
        if !unique.contains(pid) {
            unique.push(pid.clone());
        }
    }
    unique
}
