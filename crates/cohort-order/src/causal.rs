//! Causal delivery ordering.
//!
//! A message is fanned out point-to-point to its destinations. Each receiver
//! delivers it immediately and acknowledges it to every other participant.
//! A process does not start its next send while any message it has sent or
//! delivered still awaits acknowledgements; everything it sends afterwards
//! therefore reaches every process only after the messages it depends on.
//!
//! ```text
//! P1 ──Send(m1)──► P2, P3
//!                   │
//!         P2 ──Ack(m1)──► P1, P3
//!         P3 ──Ack(m1)──► P1, P2
//!                   │
//! P1 (all acks) ──Send(m2)──► ...
//! ```
//!
//! Acks can overtake the message they acknowledge (they travel on other
//! connections). Those are parked in a bounded early-ack table until the
//! message arrives.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use bytes::Bytes;
use cohort_types::{CausalId, CausalRelation, ProcessId, find_duplicate};
use tracing::{debug, trace, warn};

use crate::error::{CausalError, OrderError, OrderResult};
use crate::{CausalPacket, Directive, OrderOutput, dedup_preserving_order};

pub type CausalOutput = OrderOutput<CausalPacket>;

/// Causal layer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalConfig {
    /// Admission limit on pending plus queued messages.
    pub max_outstanding: usize,
    /// Messages for which early acks are remembered before the oldest is
    /// evicted.
    pub early_ack_capacity: usize,
}

impl Default for CausalConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 1024,
            early_ack_capacity: 4096,
        }
    }
}

/// A causally ordered send that has not been fanned out yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalRequest {
    pub payload: Bytes,
    pub destinations: Vec<ProcessId>,
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CausalStats {
    pub sent: u64,
    pub delivered: u64,
    /// Duplicate `Send`s ignored by the delivered-range guard.
    pub duplicates: u64,
    /// Early-ack entries dropped because the table was full.
    pub evicted_early_acks: u64,
}

// ============================================================================
// Delivered Ranges
// ============================================================================

/// Inclusive run of consecutive ids from one sender.
#[derive(Debug, Clone)]
struct DeliveredRange {
    first: CausalId,
    last: CausalId,
}

impl DeliveredRange {
    fn contains(&self, id: &CausalId) -> bool {
        id.sender == self.first.sender
            && self.first.sequence <= id.sequence
            && id.sequence <= self.last.sequence
    }
}

/// Compact record of every delivered id: one sorted run list per sender.
/// Senders number their messages consecutively, so each list normally holds
/// a single run.
#[derive(Debug, Default)]
struct DeliveredSet {
    ranges: HashMap<ProcessId, Vec<DeliveredRange>>,
}

impl DeliveredSet {
    fn contains(&self, id: &CausalId) -> bool {
        self.ranges
            .get(&id.sender)
            .is_some_and(|runs| runs.iter().any(|r| r.contains(id)))
    }

    /// Records `id`. Returns false if it was already present.
    fn insert(&mut self, id: &CausalId) -> bool {
        if self.contains(id) {
            return false;
        }
        let runs = self.ranges.entry(id.sender.clone()).or_default();

        let after = runs
            .iter()
            .position(|r| r.last.relation(id) == CausalRelation::Predecessor);
        let before = runs
            .iter()
            .position(|r| r.first.relation(id) == CausalRelation::Successor);

        match (after, before) {
            (Some(a), Some(b)) => {
                // `id` closes the gap between two runs.
                let upper = runs.remove(b);
                let a = if b < a { a - 1 } else { a };
                runs[a].last = upper.last;
            }
            (Some(a), None) => runs[a].last = id.clone(),
            (None, Some(b)) => runs[b].first = id.clone(),
            (None, None) => {
                let at = runs.partition_point(|r| r.last.sequence < id.sequence);
                runs.insert(
                    at,
                    DeliveredRange {
                        first: id.clone(),
                        last: id.clone(),
                    },
                );
            }
        }
        true
    }

    fn forget(&mut self, sender: &ProcessId) {
        self.ranges.remove(sender);
    }

    #[cfg(test)]
    fn run_count(&self, sender: &ProcessId) -> usize {
        self.ranges.get(sender).map_or(0, Vec::len)
    }
}

// ============================================================================
// Causal Layer
// ============================================================================

#[derive(Debug)]
struct EarlyAck {
    arrival: u64,
    from: BTreeSet<ProcessId>,
}

/// The causal ordering state machine.
#[derive(Debug)]
pub struct CausalLayer {
    local: ProcessId,
    config: CausalConfig,
    initialized: bool,
    members: Vec<ProcessId>,
    next_sequence: u64,
    /// Residual acknowledgements awaited per message.
    pending: BTreeMap<CausalId, BTreeSet<ProcessId>>,
    queue: VecDeque<CausalRequest>,
    early_acks: HashMap<CausalId, EarlyAck>,
    /// Arrival order of `early_acks`, oldest first.
    early_order: BTreeMap<u64, CausalId>,
    early_arrivals: u64,
    delivered: DeliveredSet,
    stats: CausalStats,
}

impl CausalLayer {
    pub fn new(local: ProcessId, config: CausalConfig) -> Self {
        Self {
            local,
            config,
            initialized: false,
            members: Vec::new(),
            next_sequence: 0,
            pending: BTreeMap::new(),
            queue: VecDeque::new(),
            early_acks: HashMap::new(),
            early_order: BTreeMap::new(),
            early_arrivals: 0,
            delivered: DeliveredSet::default(),
            stats: CausalStats::default(),
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Records the member list and announces it to the transport.
    pub fn init(&mut self, members: &[ProcessId]) -> OrderResult<CausalOutput> {
        if self.initialized {
            return Err(OrderError::AlreadyInitialized);
        }
        if let Some(pid) = find_duplicate(members) {
            return Err(OrderError::DuplicateMember(pid.clone()));
        }

        self.members = members.to_vec();
        self.initialized = true;
        debug!(pid = %self.local, members = members.len(), "causal layer initialized");

        let mut output = CausalOutput::empty();
        output
            .directives
            .push(Directive::Members(self.members.clone()));
        Ok(output)
    }

    /// Sends `payload` to `destinations` in causal order.
    ///
    /// The message goes out at once if nothing is awaiting acknowledgement,
    /// otherwise it is queued behind the outstanding messages. When
    /// [`CausalLayer::outstanding`] has reached `max_outstanding` the request
    /// is handed back in [`CausalError::WindowFull`].
    pub fn send(
        &mut self,
        payload: Bytes,
        destinations: &[ProcessId],
    ) -> Result<CausalOutput, CausalError> {
        self.ensure_initialized()?;
        if destinations.is_empty() {
            return Err(OrderError::NoDestinations.into());
        }
        let destinations = dedup_preserving_order(destinations);
        if let Some(unknown) = destinations.iter().find(|d| !self.members.contains(d)) {
            return Err(OrderError::UnknownProcess(unknown.clone()).into());
        }

        let request = CausalRequest {
            payload,
            destinations,
        };
        let outstanding = self.outstanding();
        if outstanding >= self.config.max_outstanding {
            return Err(CausalError::WindowFull {
                outstanding,
                request,
            });
        }

        let mut output = CausalOutput::empty();
        if self.pending.is_empty() {
            self.start_send(request, &mut output);
            self.drain_queue(&mut output);
        } else {
            trace!(queued = self.queue.len() + 1, "queueing causal send");
            self.queue.push_back(request);
        }
        Ok(output)
    }

    /// Handles one packet from `source`.
    pub fn deliver(&mut self, source: &ProcessId, packet: CausalPacket) -> OrderResult<CausalOutput> {
        self.ensure_initialized()?;
        if !self.members.contains(source) {
            return Err(OrderError::UnknownProcess(source.clone()));
        }

        let mut output = CausalOutput::empty();
        match packet {
            CausalPacket::Send {
                id,
                destinations,
                payload,
            } => self.on_send(source, id, destinations, payload, &mut output),
            CausalPacket::Ack { id } => self.on_ack(source, id, &mut output),
        }
        Ok(output)
    }

    /// Moves to a new member list.
    ///
    /// Departed members will never acknowledge anything, so they are removed
    /// from every residual set; messages that become fully acknowledged this
    /// way complete and the queue drains. On an uninitialized layer this is
    /// `init`.
    pub fn apply_view(&mut self, members: &[ProcessId]) -> OrderResult<CausalOutput> {
        if !self.initialized {
            return self.init(members);
        }
        if let Some(pid) = find_duplicate(members) {
            return Err(OrderError::DuplicateMember(pid.clone()));
        }

        let departed: Vec<ProcessId> = self
            .members
            .iter()
            .filter(|p| !members.contains(p))
            .cloned()
            .collect();
        self.members = members.to_vec();

        let mut output = CausalOutput::empty();
        for pid in &departed {
            self.delivered.forget(pid);
            let ids: Vec<CausalId> = self.pending.keys().cloned().collect();
            for id in ids {
                self.remove_awaited(&id, pid, &mut output);
            }
        }
        self.drain_queue(&mut output);

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

    /// Pending plus queued messages; the quantity admission control bounds.
    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.queue.len()
    }

    /// Returns true if a `send` would be admitted.
    pub fn has_capacity(&self) -> bool {
        self.outstanding() < self.config.max_outstanding
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Processes whose ack for `id` is still awaited.
    pub fn awaiting(&self, id: &CausalId) -> Option<&BTreeSet<ProcessId>> {
        self.pending.get(id)
    }

    pub fn early_ack_len(&self) -> usize {
        self.early_acks.len()
    }

    pub fn stats(&self) -> CausalStats {
        self.stats
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_initialized(&self) -> OrderResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(OrderError::NotInitialized)
        }
    }

    /// Fans one message out. Self-delivery is synthesized here rather than
    /// round-tripped through the transport.
    fn start_send(&mut self, request: CausalRequest, output: &mut CausalOutput) {
        let CausalRequest {
            payload,
            destinations,
        } = request;
        let id = CausalId::new(self.local.clone(), self.next_sequence);
        self.next_sequence += 1;
        self.stats.sent += 1;

        let residual: BTreeSet<ProcessId> = destinations
            .iter()
            .filter(|d| **d != self.local)
            .cloned()
            .collect();

        // Sends before acks, so no remote sees our ack ahead of the message.
        for destination in destinations.iter().filter(|d| **d != self.local) {
            output.send(
                destination.clone(),
                CausalPacket::Send {
                    id: id.clone(),
                    destinations: destinations.clone(),
                    payload: payload.clone(),
                },
            );
        }

        if destinations.contains(&self.local) {
            self.delivered.insert(&id);
            self.stats.delivered += 1;
            output.deliver(self.local.clone(), payload);
            for other in &residual {
                output.send(other.clone(), CausalPacket::Ack { id: id.clone() });
            }
        }

        debug!(id = %id, destinations = destinations.len(), "causal send");
        if residual.is_empty() {
            output.completed.push(id);
        } else {
            self.pending.insert(id, residual);
        }
    }

    fn on_send(
        &mut self,
        source: &ProcessId,
        id: CausalId,
        destinations: Vec<ProcessId>,
        payload: Bytes,
        output: &mut CausalOutput,
    ) {
        if !self.delivered.insert(&id) {
            warn!(id = %id, source = %source, "ignoring duplicate causal send");
            self.stats.duplicates += 1;
            return;
        }
        self.stats.delivered += 1;
        output.deliver(id.sender.clone(), payload);

        let mut ack_to: Vec<&ProcessId> = destinations.iter().collect();
        ack_to.push(&id.sender);
        ack_to.push(source);
        let mut acked = BTreeSet::new();
        for participant in ack_to {
            if *participant != self.local && acked.insert(participant.clone()) {
                output.send(participant.clone(), CausalPacket::Ack { id: id.clone() });
            }
        }

        // The sender may still be in a view that lists processes this one has
        // already removed; those will never ack here.
        let mut residual: BTreeSet<ProcessId> = destinations
            .into_iter()
            .filter(|d| *d != self.local && self.members.contains(d))
            .collect();
        if let Some(early) = self.take_early_acks(&id) {
            residual.retain(|p| !early.contains(p));
        }

        trace!(id = %id, awaiting = residual.len(), "causal deliver");
        if !residual.is_empty() {
            self.pending.insert(id, residual);
        }
    }

    fn on_ack(&mut self, source: &ProcessId, id: CausalId, output: &mut CausalOutput) {
        if self.pending.contains_key(&id) {
            self.remove_awaited(&id, source, output);
            self.drain_queue(output);
            return;
        }

        let stale = if id.sender == self.local {
            id.sequence < self.next_sequence
        } else {
            self.delivered.contains(&id)
        };
        if stale {
            trace!(id = %id, source = %source, "ignoring ack for settled message");
            return;
        }

        self.record_early_ack(source, id);
    }

    /// Removes `pid` from the residual set of `id`, completing the entry
    /// when nothing is left.
    fn remove_awaited(&mut self, id: &CausalId, pid: &ProcessId, output: &mut CausalOutput) {
        let Some(residual) = self.pending.get_mut(id) else {
            return;
        };
        residual.remove(pid);
        if residual.is_empty() {
            self.pending.remove(id);
            trace!(id = %id, "causal message fully acknowledged");
            if id.sender == self.local {
                output.completed.push(id.clone());
            }
        }
    }

    /// Starts queued sends while nothing is awaiting acknowledgement.
    fn drain_queue(&mut self, output: &mut CausalOutput) {
        while self.pending.is_empty() {
            let Some(request) = self.queue.pop_front() else {
                return;
            };
            self.start_send(request, output);
        }
    }

    fn record_early_ack(&mut self, source: &ProcessId, id: CausalId) {
        if let Some(entry) = self.early_acks.get_mut(&id) {
            entry.from.insert(source.clone());
            return;
        }

        if self.early_acks.len() >= self.config.early_ack_capacity {
            if let Some((_, evicted)) = self.early_order.pop_first() {
                self.early_acks.remove(&evicted);
                self.stats.evicted_early_acks += 1;
                warn!(id = %evicted, "early-ack table full, evicting oldest entry");
            }
        }

        trace!(id = %id, source = %source, "recording early ack");
        let arrival = self.early_arrivals;
        self.early_arrivals += 1;
        self.early_order.insert(arrival, id.clone());
        self.early_acks.insert(
            id,
            EarlyAck {
                arrival,
                from: BTreeSet::from([source.clone()]),
            },
        );
    }

    fn take_early_acks(&mut self, id: &CausalId) -> Option<BTreeSet<ProcessId>> {
        let entry = self.early_acks.remove(id)?;
        self.early_order.remove(&entry.arrival);
        Some(entry.from)
    }
}
