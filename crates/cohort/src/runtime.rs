//! The stack thread: one poll loop driving the transport and all layers.
//!
//! ```text
//!   StackHandle ──► commands ──┐
//!                              ▼
//!   ┌──────────────────── cohort-stack ────────────────────┐
//!   │  MembershipLayer ─ views ─► FifoLayer, CausalLayer   │
//!   │         │                        │                   │
//!   │         └──── Envelope ──► PeerTable ◄── Transport   │
//!   └──────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                       EventHandlers
//! ```
//!
//! The layers are pure; every output they return is executed here, in the
//! order it was produced.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cohort_config::CohortConfig;
use cohort_membership::{MembershipDirective, MembershipLayer, MembershipOutput, View};
use cohort_net::{ConnectionId, Transport, TransportConfig, TransportEvent};
use cohort_order::{
    CausalConfig, CausalError, CausalLayer, CausalPacket, CausalRequest, Directive, FifoConfig,
    FifoLayer, FifoPacket, OrderOutput,
};
use cohort_types::ProcessId;
use tracing::{debug, error, info, trace, warn};

use crate::envelope::Envelope;
use crate::error::{StackError, StackResult};
use crate::events::{EventHandlers, StackEvent};
use crate::handle::{Command, Completion, Destinations, Shared, StackHandle};
use crate::peers::PeerTable;

/// Commands taken from the queue per loop iteration.
const COMMAND_BATCH: usize = 256;

/// Packets held for a source outside the local view before the oldest is
/// dropped.
const HELD_LIMIT: usize = 16 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Everything needed to start one stack.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Local identity. Port 0 binds an ephemeral port.
    pub local: ProcessId,
    /// Initial view. Empty waits for a state transfer from a member.
    pub members: Vec<ProcessId>,
    pub transport: TransportConfig,
    pub fifo: FifoConfig,
    pub causal: CausalConfig,
    pub command_queue_capacity: usize,
    /// Longest the loop blocks in the transport without events or commands.
    pub poll_interval: Duration,
    /// How often view members without a connection are redialed.
    pub reconnect_interval: Duration,
}

impl StackConfig {
    /// A configuration with default tuning.
    pub fn new(local: ProcessId, members: Vec<ProcessId>) -> Self {
        Self {
            local,
            members,
            transport: TransportConfig::default(),
            fifo: FifoConfig::default(),
            causal: CausalConfig::default(),
            command_queue_capacity: 1024,
            poll_interval: Duration::from_millis(100),
            reconnect_interval: Duration::from_secs(1),
        }
    }

    /// Builds the stack configuration from a validated file configuration.
    pub fn from_config(config: &CohortConfig) -> StackResult<Self> {
        config.validate()?;
        Ok(Self {
            local: config.local_pid(),
            members: config.initial_members()?,
            transport: TransportConfig {
                max_frame_size: config.transport.max_frame_size,
                buffer_size: config.transport.buffer_size,
                nodelay: config.transport.nodelay,
                ..TransportConfig::default()
            },
            fifo: FifoConfig {
                max_buffered_per_source: config.fifo.max_buffered_per_source,
            },
            causal: CausalConfig {
                max_outstanding: config.causal.max_outstanding,
                early_ack_capacity: config.causal.early_ack_capacity,
            },
            command_queue_capacity: config.runtime.command_queue_capacity,
            poll_interval: Duration::from_millis(config.runtime.poll_interval_ms),
            reconnect_interval: Duration::from_millis(config.runtime.reconnect_interval_ms),
        })
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Starts stacks.
pub struct Runtime;

impl Runtime {
    /// Binds the transport, initialises the layers with the initial members
    /// and spawns the `cohort-stack` thread.
    ///
    /// If `config.local` names port 0, every initial member equal to it is
    /// rewritten to the bound port before the layers see the view.
    ///
    /// A panic on the stack thread is logged and aborts the process.
    pub fn spawn(config: StackConfig, handlers: EventHandlers) -> StackResult<StackHandle> {
        let transport = Transport::bind(config.local.clone(), config.transport.clone())?;
        let local = transport.local_pid().clone();
        let members: Vec<ProcessId> = config
            .members
            .iter()
            .map(|m| if *m == config.local { local.clone() } else { m.clone() })
            .collect();

        let shared = Arc::new(Shared::new(
            local.clone(),
            config.command_queue_capacity,
            transport.waker(),
        ));

        let mut stack = Stack {
            shared: Arc::clone(&shared),
            fifo: FifoLayer::new(local.clone(), config.fifo.clone()),
            causal: CausalLayer::new(local.clone(), config.causal.clone()),
            membership: MembershipLayer::new(local.clone()),
            peers: PeerTable::new(local.clone()),
            transport,
            handlers,
            parked: VecDeque::new(),
            held: VecDeque::new(),
            poll_interval: config.poll_interval,
            reconnect_interval: config.reconnect_interval,
            last_reconnect: Instant::now(),
        };
        stack.init(&members)?;

        let thread = thread::Builder::new()
            .name("cohort-stack".to_string())
            .spawn(move || {
                let _ = stack.shared.stack_thread.set(thread::current().id());
                let pid = stack.shared.local.clone();
                if panic::catch_unwind(AssertUnwindSafe(|| stack.run())).is_err() {
                    error!(pid = %pid, "stack thread panicked, aborting");
                    std::process::abort();
                }
            })?;
        *shared
            .thread
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(thread);

        info!(pid = %local, members = members.len(), "stack started");
        Ok(StackHandle::new(shared))
    }
}

// ============================================================================
// Stack
// ============================================================================

/// Owns the transport and the layers; lives on the stack thread.
struct Stack {
    shared: Arc<Shared>,
    transport: Transport,
    fifo: FifoLayer,
    causal: CausalLayer,
    membership: MembershipLayer,
    peers: PeerTable,
    handlers: EventHandlers,
    /// Causal sends refused by a full window, oldest first.
    parked: VecDeque<(CausalRequest, Completion<()>)>,
    /// Ordering-layer packets from sources the local view does not contain
    /// yet, in arrival order.
    held: VecDeque<(ProcessId, Envelope)>,
    poll_interval: Duration,
    reconnect_interval: Duration,
    last_reconnect: Instant,
}

impl Stack {
    fn init(&mut self, members: &[ProcessId]) -> StackResult<()> {
        let output = self.membership.init(members)?;
        self.apply_membership(output);
        Ok(())
    }

    fn run(&mut self) {
        info!(pid = %self.shared.local, addr = %self.transport.local_addr(), "stack running");
        let mut events = Vec::new();

        while !self.shared.stopping.load(Ordering::Acquire) {
            for command in self.shared.commands.pop_batch(COMMAND_BATCH) {
                self.on_command(command);
            }

            let timeout = if self.shared.commands.is_empty() {
                self.poll_interval
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.transport.poll(&mut events, Some(timeout)) {
                error!(error = %e, "transport poll failed, stopping stack");
                break;
            }
            for event in events.drain(..) {
                self.on_transport_event(event);
            }

            self.admit_parked();
            if self.last_reconnect.elapsed() >= self.reconnect_interval {
                self.reconnect();
            }
        }

        self.finish();
    }

    /// Fails everything still waiting on the stack and marks it exited.
    fn finish(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        for (_, admitted) in self.parked.drain(..) {
            admitted.complete(Err(StackError::Shutdown));
        }
        for command in self.shared.commands.drain() {
            command.abandon();
        }
        self.shared.exited.store(true, Ordering::Release);
        info!(pid = %self.shared.local, "stack stopped");
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn on_command(&mut self, command: Command) {
        match command {
            Command::FifoSend { payload, to } => {
                let destinations = resolve(to, self.fifo.members());
                match self.fifo.send(payload, &destinations) {
                    Ok(output) => self.apply_fifo(output),
                    Err(e) => warn!(error = %e, "fifo send rejected"),
                }
            }
            Command::CausalSend {
                payload,
                to,
                admitted,
            } => {
                let destinations = resolve(to, self.causal.members());
                let request = CausalRequest {
                    payload,
                    destinations,
                };
                if self.parked.is_empty() {
                    self.try_causal(request, admitted);
                } else {
                    self.parked.push_back((request, admitted));
                }
            }
            Command::Join(pid) => {
                let output = self.membership.join(pid);
                self.apply_membership(output);
            }
            Command::Remove(pid) => {
                let output = self.membership.remove(pid);
                self.apply_membership(output);
            }
            Command::Adeliver(op) => {
                debug!(op = %op, "adeliver");
                let output = self.membership.adeliver(op);
                self.apply_membership(output);
            }
            Command::View(reply) => reply.complete(Ok(self.membership.view().cloned())),
        }
    }

    /// Submits one causal send; a full window parks it.
    ///
    /// Returns false if the send was parked.
    fn try_causal(&mut self, request: CausalRequest, admitted: Completion<()>) -> bool {
        let CausalRequest {
            payload,
            destinations,
        } = request;
        match self.causal.send(payload, &destinations) {
            Ok(output) => {
                admitted.complete(Ok(()));
                self.apply_causal(output);
                true
            }
            Err(CausalError::WindowFull {
                outstanding,
                request,
            }) => {
                debug!(outstanding, "causal window full, parking send");
                self.parked.push_front((request, admitted));
                false
            }
            Err(CausalError::Order(e)) => {
                admitted.complete(Err(e.into()));
                true
            }
        }
    }

    fn admit_parked(&mut self) {
        while self.causal.has_capacity() {
            let Some((request, admitted)) = self.parked.pop_front() else {
                return;
            };
            if !self.try_causal(request, admitted) {
                return;
            }
        }
    }

    fn reconnect(&mut self) {
        self.last_reconnect = Instant::now();
        let Some(view) = self.membership.view() else {
            return;
        };
        let members = view.members().to_vec();
        for pid in &members {
            self.peers.ensure(pid, &mut self.transport);
        }
    }

    // ========================================================================
    // Transport Events
    // ========================================================================

    fn on_transport_event(&mut self, event: TransportEvent) {
        let mut upward = Vec::new();
        match event {
            TransportEvent::Accepted {
                connection,
                remote,
                key,
            } => {
                self.peers.on_established(
                    connection,
                    remote,
                    Some(key),
                    &mut self.transport,
                    &mut upward,
                );
            }
            TransportEvent::Connected {
                connection,
                remote,
                key,
            } => {
                self.peers
                    .on_established(connection, remote, key, &mut self.transport, &mut upward);
            }
            TransportEvent::Closed { connection, remote } => {
                self.peers
                    .on_lost(connection, remote, "closed by peer", &mut upward);
            }
            TransportEvent::Broken {
                connection,
                remote,
                reason,
            } => {
                self.peers.on_lost(connection, remote, &reason, &mut upward);
            }
            TransportEvent::Received {
                connection,
                payload,
            } => self.on_frame(connection, &payload),
            TransportEvent::ReadyForNextMessage { connection } => {
                self.peers.on_ready(connection, &mut self.transport);
            }
        }
        for event in upward {
            self.handlers.dispatch(event);
        }
    }

    fn on_frame(&mut self, connection: ConnectionId, payload: &[u8]) {
        let Some(source) = self.peers.pid_of(connection).cloned() else {
            warn!(connection = %connection, "frame on unidentified connection");
            return;
        };
        match Envelope::decode(payload) {
            Ok(envelope) => {
                trace!(source = %source, kind = envelope.kind(), "envelope received");
                self.route(source, envelope);
            }
            Err(e) => warn!(source = %source, error = %e, "dropping undecodable frame"),
        }
    }

    fn route(&mut self, source: ProcessId, envelope: Envelope) {
        match envelope {
            Envelope::State(transfer) => match self.membership.deliver_state(&source, transfer) {
                Ok(output) => self.apply_membership(output),
                Err(e) => error!(source = %source, error = %e, "rejected state transfer"),
            },
            Envelope::Fifo(packet) => {
                if !self.fifo.members().contains(&source) {
                    self.hold(source, Envelope::Fifo(packet));
                    return;
                }
                match self.fifo.deliver(&source, packet) {
                    Ok(output) => self.apply_fifo(output),
                    Err(e) => warn!(source = %source, error = %e, "fifo packet rejected"),
                }
            }
            Envelope::Causal(packet) => {
                if !self.causal.members().contains(&source) {
                    self.hold(source, Envelope::Causal(packet));
                    return;
                }
                match self.causal.deliver(&source, packet) {
                    Ok(output) => self.apply_causal(output),
                    Err(e) => warn!(source = %source, error = %e, "causal packet rejected"),
                }
            }
        }
    }

    /// Keeps a packet from a process this stack does not consider a member
    /// yet: it installed a view that this stack has not agreed on so far.
    fn hold(&mut self, source: ProcessId, envelope: Envelope) {
        debug!(source = %source, kind = envelope.kind(), "holding packet until the source joins the view");
        if self.held.len() >= HELD_LIMIT {
            if let Some((dropped, envelope)) = self.held.pop_front() {
                warn!(source = %dropped, kind = envelope.kind(), "held packet limit reached, dropping oldest");
            }
        }
        self.held.push_back((source, envelope));
    }

    fn replay_held(&mut self) {
        let held = std::mem::take(&mut self.held);
        for (source, envelope) in held {
            self.route(source, envelope);
        }
    }

    // ========================================================================
    // Layer Outputs
    // ========================================================================

    fn apply_membership(&mut self, output: MembershipOutput) {
        let MembershipOutput {
            abcast,
            transfers,
            directives,
            new_views,
        } = output;

        for directive in directives {
            match directive {
                MembershipDirective::JoinList(members) => {
                    for pid in &members {
                        self.peers.ensure(pid, &mut self.transport);
                    }
                }
                MembershipDirective::Added(pid) => self.peers.ensure(&pid, &mut self.transport),
                MembershipDirective::Removed(pid) => {
                    if pid != self.shared.local {
                        self.peers.forget(&pid, &mut self.transport);
                    }
                }
            }
        }
        for transfer in transfers {
            self.send_envelope(&transfer.destination, &Envelope::State(transfer.transfer));
        }
        for view in new_views {
            self.install(view);
        }
        for op in abcast {
            self.handlers.dispatch(StackEvent::Abcast(op));
        }
    }

    /// Moves the ordering layers to `view` and announces it.
    fn install(&mut self, view: View) {
        match self.fifo.apply_view(view.members()) {
            Ok(output) => self.apply_fifo(output),
            Err(e) => error!(view = %view, error = %e, "fifo layer rejected view"),
        }
        match self.causal.apply_view(view.members()) {
            Ok(output) => self.apply_causal(output),
            Err(e) => error!(view = %view, error = %e, "causal layer rejected view"),
        }
        self.handlers.dispatch(StackEvent::NewView(view));
        self.replay_held();
        self.admit_parked();
    }

    fn apply_fifo(&mut self, output: OrderOutput<FifoPacket>) {
        self.apply_directives(&output.directives);
        for send in output.sends {
            self.send_envelope(&send.destination, &Envelope::Fifo(send.packet));
        }
        for delivery in output.delivered {
            self.handlers.dispatch(StackEvent::FifoDelivered {
                source: delivery.source,
                payload: delivery.payload,
            });
        }
    }

    fn apply_causal(&mut self, output: OrderOutput<CausalPacket>) {
        self.apply_directives(&output.directives);
        for send in output.sends {
            self.send_envelope(&send.destination, &Envelope::Causal(send.packet));
        }
        for delivery in output.delivered {
            self.handlers.dispatch(StackEvent::CausalDelivered {
                source: delivery.source,
                payload: delivery.payload,
            });
        }
        for id in output.completed {
            trace!(id = %id, "causal send acknowledged by every destination");
        }
    }

    fn apply_directives(&mut self, directives: &[Directive]) {
        for Directive::Members(members) in directives {
            for pid in members {
                self.peers.ensure(pid, &mut self.transport);
            }
        }
    }

    fn send_envelope(&mut self, destination: &ProcessId, envelope: &Envelope) {
        let bytes: Bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(destination = %destination, kind = envelope.kind(), error = %e, "failed to encode envelope");
                return;
            }
        };
        self.peers.send(destination, bytes, &mut self.transport);
    }
}

fn resolve(to: Destinations, members: &[ProcessId]) -> Vec<ProcessId> {
    match to {
        Destinations::View => members.to_vec(),
        Destinations::Processes(processes) => processes,
    }
}
