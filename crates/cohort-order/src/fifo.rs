//! FIFO delivery ordering.
//!
//! Every (sender, destination) pair is an independent stream. The sender
//! stamps each packet with its position in the stream to that destination;
//! the receiver delivers a packet only when every earlier one from the same
//! sender has been delivered, buffering anything that arrives early.
//!
//! ```text
//! arrival:   m1   m2   m0
//!             │    │    │
//!             ▼    ▼    ▼
//! buffer:   {1}  {1,2}  ─── deliver m0, drain m1, m2
//! ```

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use cohort_types::{ProcessId, find_duplicate};
use tracing::{debug, warn};

use crate::error::{OrderError, OrderResult};
use crate::{Directive, FifoPacket, OrderOutput, dedup_preserving_order};

pub type FifoOutput = OrderOutput<FifoPacket>;

/// FIFO layer tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FifoConfig {
    /// Upper bound on out-of-order packets buffered per source. `None`
    /// buffers without limit.
    pub max_buffered_per_source: Option<usize>,
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FifoStats {
    pub sent: u64,
    pub delivered: u64,
    /// Packets that arrived ahead of their turn.
    pub reordered: u64,
    /// Redelivered packets dropped by the sequence guard.
    pub duplicates: u64,
}

/// Receive-side state for one source.
#[derive(Debug, Default)]
struct SourceState {
    /// Next sequence number expected from this source.
    expected: u64,
    buffer: BTreeMap<u64, Bytes>,
}

/// The FIFO ordering state machine.
#[derive(Debug)]
pub struct FifoLayer {
    local: ProcessId,
    config: FifoConfig,
    initialized: bool,
    members: Vec<ProcessId>,
    /// Next sequence number per destination.
    sent: HashMap<ProcessId, u64>,
    sources: HashMap<ProcessId, SourceState>,
    stats: FifoStats,
}

impl FifoLayer {
    pub fn new(local: ProcessId, config: FifoConfig) -> Self {
        Self {
            local,
            config,
            initialized: false,
            members: Vec::new(),
            sent: HashMap::new(),
            sources: HashMap::new(),
            stats: FifoStats::default(),
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Seeds zeroed counters for every member and announces the member list.
    ///
    /// A duplicate member fails the call and leaves the layer uninitialized.
    pub fn init(&mut self, members: &[ProcessId]) -> OrderResult<FifoOutput> {
        if self.initialized {
            return Err(OrderError::AlreadyInitialized);
        }
        if let Some(pid) = find_duplicate(members) {
            return Err(OrderError::DuplicateMember(pid.clone()));
        }

        for pid in members {
            self.sent.insert(pid.clone(), 0);
            self.sources.insert(pid.clone(), SourceState::default());
        }
        self.members = members.to_vec();
        self.initialized = true;
        debug!(pid = %self.local, members = members.len(), "fifo layer initialized");

        let mut output = FifoOutput::empty();
        output
            .directives
            .push(Directive::Members(self.members.clone()));
        Ok(output)
    }

    /// Stamps `payload` once per destination and emits one packet to each.
    ///
    /// All destinations are checked before any counter moves, so an unknown
    /// destination leaves the layer untouched. Sending to the local process
    /// takes the same path; the transport loopback delivers it.
    pub fn send(&mut self, payload: Bytes, destinations: &[ProcessId]) -> OrderResult<FifoOutput> {
        self.ensure_initialized()?;
        if destinations.is_empty() {
            return Err(OrderError::NoDestinations);
        }
        let destinations = dedup_preserving_order(destinations);
        if let Some(unknown) = destinations.iter().find(|d| !self.sent.contains_key(*d)) {
            return Err(OrderError::UnknownProcess(unknown.clone()));
        }

        let mut output = FifoOutput::empty();
        for destination in destinations {
            let Some(next) = self.sent.get_mut(&destination) else {
                continue;
            };
            let sequence = *next;
            *next += 1;
            self.stats.sent += 1;
            output.send(
                destination,
                FifoPacket {
                    sequence,
                    payload: payload.clone(),
                },
            );
        }
        Ok(output)
    }

    /// Accepts one packet from `source`, delivering it and any buffered
    /// successors when it is next in line.
    pub fn deliver(&mut self, source: &ProcessId, packet: FifoPacket) -> OrderResult<FifoOutput> {
        self.ensure_initialized()?;
        let limit = self.config.max_buffered_per_source;
        let state = self
            .sources
            .get_mut(source)
            .ok_or_else(|| OrderError::UnknownProcess(source.clone()))?;

        let mut output = FifoOutput::empty();
        let FifoPacket { sequence, payload } = packet;

        if sequence < state.expected || state.buffer.contains_key(&sequence) {
            warn!(
                source = %source,
                sequence,
                expected = state.expected,
                "dropping redelivered fifo packet"
            );
            self.stats.duplicates += 1;
            return Ok(output);
        }

        if sequence > state.expected {
            if let Some(limit) = limit {
                if state.buffer.len() >= limit {
                    return Err(OrderError::ReorderBufferFull {
                        source_pid: source.clone(),
                        limit,
                    });
                }
            }
            debug!(source = %source, sequence, expected = state.expected, "buffering early fifo packet");
            state.buffer.insert(sequence, payload);
            self.stats.reordered += 1;
            return Ok(output);
        }

        output.deliver(source.clone(), payload);
        state.expected += 1;
        while let Some(next) = state.buffer.remove(&state.expected) {
            output.deliver(source.clone(), next);
            state.expected += 1;
        }
        self.stats.delivered += output.delivered.len() as u64;
        Ok(output)
    }

    /// Moves to a new member list: new members start at sequence zero in
    /// both directions, departed members' state is discarded.
    ///
    /// On an uninitialized layer this is `init`.
    pub fn apply_view(&mut self, members: &[ProcessId]) -> OrderResult<FifoOutput> {
        if !self.initialized {
            return self.init(members);
        }
        if let Some(pid) = find_duplicate(members) {
            return Err(OrderError::DuplicateMember(pid.clone()));
        }

        for departed in self.members.iter().filter(|p| !members.contains(p)) {
            self.sent.remove(departed);
            if let Some(state) = self.sources.remove(departed) {
                if !state.buffer.is_empty() {
                    warn!(
                        source = %departed,
                        discarded = state.buffer.len(),
                        "discarding buffered fifo packets of departed member"
                    );
                }
            }
        }
        for pid in members {
            self.sent.entry(pid.clone()).or_insert(0);
            self.sources.entry(pid.clone()).or_default();
        }
        self.members = members.to_vec();

        let mut output = FifoOutput::empty();
        output
            .directives
            .push(Directive::Members(self.members.clone()));
        Ok(output)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn local(&self) -> &ProcessId {
        &self.local
    }

    pub fn members(&self) -> &[ProcessId] {
        &self.members
    }

    pub fn stats(&self) -> FifoStats {
        self.stats
    }

    /// Sequence number the next packet to `destination` will carry.
    pub fn next_sequence(&self, destination: &ProcessId) -> Option<u64> {
        self.sent.get(destination).copied()
    }

    /// Sequence number next deliverable from `source`.
    pub fn expected_sequence(&self, source: &ProcessId) -> Option<u64> {
        self.sources.get(source).map(|s| s.expected)
    }

    /// Number of packets from `source` waiting for a gap to fill.
    pub fn buffered(&self, source: &ProcessId) -> usize {
        self.sources.get(source).map_or(0, |s| s.buffer.len())
    }

    fn ensure_initialized(&self) -> OrderResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(OrderError::NotInitialized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pid(port: u16) -> ProcessId {
        ProcessId::new("127.0.0.1", port, 0)
    }

    fn packet(sequence: u64, payload: &'static str) -> FifoPacket {
        FifoPacket {
            sequence,
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    fn payloads(output: &FifoOutput) -> Vec<&[u8]> {
        output.delivered.iter().map(|d| d.payload.as_ref()).collect()
    }

    fn layer(members: &[ProcessId]) -> FifoLayer {
        let mut layer = FifoLayer::new(members[0].clone(), FifoConfig::default());
        layer.init(members).unwrap();
        layer
    }

    #[test]
    fn init_announces_members() {
        let members = vec![pid(1), pid(2)];
        let mut layer = FifoLayer::new(pid(1), FifoConfig::default());
        let output = layer.init(&members).unwrap();
        assert_eq!(output.directives, vec![Directive::Members(members)]);
        assert!(layer.is_initialized());
        assert_eq!(layer.next_sequence(&pid(2)), Some(0));
        assert_eq!(layer.expected_sequence(&pid(2)), Some(0));
    }

    #[test]
    fn init_rejects_duplicate_member() {
        let mut layer = FifoLayer::new(pid(1), FifoConfig::default());
        assert_eq!(
            layer.init(&[pid(1), pid(2), pid(1)]),
            Err(OrderError::DuplicateMember(pid(1)))
        );
        assert!(!layer.is_initialized());
        assert_eq!(
            layer.send(Bytes::new(), &[pid(1)]),
            Err(OrderError::NotInitialized)
        );
    }

    #[test]
    fn send_stamps_each_destination_independently() {
        let mut layer = layer(&[pid(1), pid(2), pid(3)]);

        layer.send(Bytes::from_static(b"a"), &[pid(2)]).unwrap();
        let output = layer
            .send(Bytes::from_static(b"b"), &[pid(2), pid(3), pid(1)])
            .unwrap();

        let stamps: Vec<(ProcessId, u64)> = output
            .sends
            .iter()
            .map(|s| (s.destination.clone(), s.packet.sequence))
            .collect();
        assert_eq!(stamps, vec![(pid(2), 1), (pid(3), 0), (pid(1), 0)]);
        assert_eq!(layer.stats().sent, 4);
    }

    #[test]
    fn unknown_destination_changes_nothing() {
        let mut layer = layer(&[pid(1), pid(2)]);
        assert_eq!(
            layer.send(Bytes::new(), &[pid(2), pid(9)]),
            Err(OrderError::UnknownProcess(pid(9)))
        );
        assert_eq!(layer.next_sequence(&pid(2)), Some(0));
    }

    #[test]
    fn reordered_arrivals_are_delivered_in_send_order() {
        let mut layer = layer(&[pid(1), pid(2)]);

        assert!(layer.deliver(&pid(2), packet(1, "m1")).unwrap().delivered.is_empty());
        assert!(layer.deliver(&pid(2), packet(2, "m2")).unwrap().delivered.is_empty());
        assert_eq!(layer.buffered(&pid(2)), 2);

        let output = layer.deliver(&pid(2), packet(0, "m0")).unwrap();
        assert_eq!(payloads(&output), vec![&b"m0"[..], b"m1", b"m2"]);
        assert!(output.delivered.iter().all(|d| d.source == pid(2)));
        assert_eq!(layer.expected_sequence(&pid(2)), Some(3));
        assert_eq!(layer.buffered(&pid(2)), 0);
    }

    #[test]
    fn redelivery_is_a_counted_no_op() {
        let mut layer = layer(&[pid(1), pid(2)]);
        layer.deliver(&pid(2), packet(0, "m0")).unwrap();
        layer.deliver(&pid(2), packet(2, "m2")).unwrap();

        // Already consumed.
        assert!(layer.deliver(&pid(2), packet(0, "again")).unwrap().is_empty());
        // Already buffered.
        assert!(layer.deliver(&pid(2), packet(2, "again")).unwrap().is_empty());

        assert_eq!(layer.stats().duplicates, 2);
        assert_eq!(layer.expected_sequence(&pid(2)), Some(1));

        let output = layer.deliver(&pid(2), packet(1, "m1")).unwrap();
        assert_eq!(payloads(&output), vec![&b"m1"[..], b"m2"]);
    }

    #[test]
    fn reorder_buffer_bound_is_enforced() {
        let config = FifoConfig {
            max_buffered_per_source: Some(2),
        };
        let mut layer = FifoLayer::new(pid(1), config);
        layer.init(&[pid(1), pid(2)]).unwrap();

        layer.deliver(&pid(2), packet(1, "m1")).unwrap();
        layer.deliver(&pid(2), packet(2, "m2")).unwrap();
        assert_eq!(
            layer.deliver(&pid(2), packet(3, "m3")),
            Err(OrderError::ReorderBufferFull {
                source_pid: pid(2),
                limit: 2
            })
        );

        // The in-order packet is never subject to the bound.
        let output = layer.deliver(&pid(2), packet(0, "m0")).unwrap();
        assert_eq!(output.delivered.len(), 3);
    }

    #[test]
    fn packet_from_non_member_is_rejected() {
        let mut layer = layer(&[pid(1), pid(2)]);
        assert_eq!(
            layer.deliver(&pid(5), packet(0, "x")),
            Err(OrderError::UnknownProcess(pid(5)))
        );
    }

    #[test]
    fn apply_view_seeds_new_and_drops_departed_members() {
        let mut layer = layer(&[pid(1), pid(2)]);
        layer.send(Bytes::new(), &[pid(2)]).unwrap();
        layer.deliver(&pid(2), packet(3, "early")).unwrap();

        let output = layer.apply_view(&[pid(1), pid(3)]).unwrap();
        assert_eq!(output.directives, vec![Directive::Members(vec![pid(1), pid(3)])]);
        assert_eq!(layer.next_sequence(&pid(2)), None);
        assert_eq!(layer.buffered(&pid(2)), 0);
        assert_eq!(layer.next_sequence(&pid(3)), Some(0));

        // Surviving members keep their counters.
        layer.send(Bytes::new(), &[pid(1)]).unwrap();
        layer.apply_view(&[pid(1), pid(3), pid(4)]).unwrap();
        assert_eq!(layer.next_sequence(&pid(1)), Some(1));
    }

    proptest! {
        /// Property: any arrival permutation of one sender's stream is
        /// delivered in send order.
        #[test]
        fn prop_any_permutation_delivers_in_order(
            order in Just((0u64..24).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let mut layer = layer(&[pid(1), pid(2)]);
            let mut delivered = Vec::new();
            for sequence in order {
                let packet = FifoPacket { sequence, payload: Bytes::from(sequence.to_le_bytes().to_vec()) };
                let output = layer.deliver(&pid(2), packet).unwrap();
                delivered.extend(output.delivered.into_iter().map(|d| d.payload));
            }
            let expected: Vec<Bytes> = (0u64..24).map(|s| Bytes::from(s.to_le_bytes().to_vec())).collect();
            prop_assert_eq!(delivered, expected);
            prop_assert_eq!(layer.buffered(&pid(2)), 0);
        }
    }
}
