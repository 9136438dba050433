//! The `mio` poll driver that owns the server and every connection.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cohort_types::ProcessId;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, Liveness, Phase};
use crate::error::{NetError, NetResult};
use crate::event::{ConnectionId, TransportEvent};
use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::server::Server;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: u64 = 2;

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest payload accepted or sent in one frame.
    pub max_frame_size: usize,
    /// Initial capacity of each connection's read and write buffers.
    pub buffer_size: usize,
    /// Disable Nagle's algorithm on every socket.
    pub nodelay: bool,
    /// Readiness events fetched per poll.
    pub events_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            buffer_size: 64 * 1024,
            nodelay: true,
            events_capacity: 1024,
        }
    }
}

/// Owns the listener and all connections of one process.
///
/// All I/O happens inside [`Transport::poll`]. Commands only update
/// connection state and mark the connection for servicing on the next poll,
/// so a command never emits an event directly.
pub struct Transport {
    local: ProcessId,
    config: TransportConfig,
    poll: Poll,
    events: Events,
    server: Server,
    waker: Arc<Waker>,
    connections: HashMap<ConnectionId, Connection>,
    next_id: u64,
    /// Connections to service on the next poll regardless of readiness.
    dirty: Vec<ConnectionId>,
    pending: VecDeque<TransportEvent>,
}

impl Transport {
    /// Binds the listener on the local identity's endpoint.
    ///
    /// If the identity names port 0, the listener binds an ephemeral port and
    /// [`Transport::local_pid`] reports the identity with the resolved port.
    pub fn bind(local: ProcessId, config: TransportConfig) -> NetResult<Self> {
        let addr = resolve(&local)?;
        let poll = Poll::new()?;
        let mut server = Server::bind(addr)?;
        poll.registry()
            .register(server.listener_mut(), LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let local = local.with_port(server.local_addr().port());
        info!(pid = %local, addr = %server.local_addr(), "transport listening");

        Ok(Self {
            local,
            events: Events::with_capacity(config.events_capacity),
            config,
            poll,
            server,
            waker,
            connections: HashMap::new(),
            next_id: FIRST_CONNECTION,
            dirty: Vec::new(),
            pending: VecDeque::new(),
        })
    }

    /// Returns the local identity, with the port the listener is bound to.
    pub fn local_pid(&self) -> &ProcessId {
        &self.local
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns a waker that interrupts a blocked [`Transport::poll`] from any
    /// thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Opens a connection to `remote`.
    ///
    /// Connecting to the local identity creates a loopback connection. A dial
    /// that fails immediately is reported as `Broken` by the next poll, so
    /// the caller handles every failure the same way.
    pub fn connect(&mut self, remote: ProcessId) -> ConnectionId {
        let id = self.allocate_id();

        if remote == self.local {
            debug!(connection = %id, "loopback connection");
            self.connections
                .insert(id, Connection::loopback(id, self.local.clone()));
            self.pending.push_back(TransportEvent::Connected {
                connection: id,
                remote,
                key: None,
            });
            return id;
        }

        match self.dial(id, &remote) {
            Ok(conn) => {
                debug!(connection = %id, remote = %remote, "dialing");
                self.connections.insert(id, conn);
            }
            Err(err) => {
                warn!(connection = %id, remote = %remote, error = %err, "dial failed");
                self.pending.push_back(TransportEvent::Broken {
                    connection: id,
                    remote: Some(remote),
                    reason: err.to_string(),
                });
            }
        }
        id
    }

    /// Closes a connection without emitting an event.
    pub fn disconnect(&mut self, id: ConnectionId) -> NetResult<()> {
        let mut conn = self
            .connections
            .remove(&id)
            .ok_or(NetError::UnknownConnection(id))?;
        self.teardown(&mut conn);
        debug!(connection = %id, "disconnected");
        Ok(())
    }

    /// Closes a connection without losing data in either direction.
    ///
    /// The pending message, if any, is still written; then the write side
    /// is shut down and the connection keeps delivering frames until the
    /// peer closes too, which is reported as `Closed`. No further
    /// `ReadyForNextMessage` is emitted. Connections that have not finished
    /// their handshake, and the loopback, are dropped at once as by
    /// [`Transport::disconnect`].
    pub fn close(&mut self, id: ConnectionId) -> NetResult<()> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetError::UnknownConnection(id))?;
        if conn.is_loopback() || conn.phase() != Phase::Connected {
            return self.disconnect(id);
        }
        conn.begin_close();
        self.dirty.push(id);
        debug!(connection = %id, "closing");
        Ok(())
    }

    /// Fills the connection's single outbound slot.
    ///
    /// # Panics
    ///
    /// Panics if the previous message has not been consumed yet; wait for
    /// [`TransportEvent::ReadyForNextMessage`].
    pub fn set_message_to_send(&mut self, id: ConnectionId, payload: Bytes) -> NetResult<()> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetError::UnknownConnection(id))?;
        conn.set_message(payload, self.config.max_frame_size)?;
        self.dirty.push(id);
        Ok(())
    }

    pub fn start_sender(&mut self, id: ConnectionId) -> NetResult<()> {
        self.set_sender(id, true)
    }

    pub fn stop_sender(&mut self, id: ConnectionId) -> NetResult<()> {
        self.set_sender(id, false)
    }

    /// Starts reading. Frames already buffered are delivered on the next poll.
    pub fn start_receiver(&mut self, id: ConnectionId) -> NetResult<()> {
        self.set_receiver(id, true)
    }

    /// Stops reading the socket; the peer stalls once kernel buffers fill.
    pub fn stop_receiver(&mut self, id: ConnectionId) -> NetResult<()> {
        self.set_receiver(id, false)
    }

    fn set_sender(&mut self, id: ConnectionId, enabled: bool) -> NetResult<()> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetError::UnknownConnection(id))?;
        conn.set_sender_enabled(enabled, &mut self.pending);
        Ok(())
    }

    fn set_receiver(&mut self, id: ConnectionId, enabled: bool) -> NetResult<()> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(NetError::UnknownConnection(id))?;
        conn.set_receiver_enabled(enabled);
        if enabled {
            // Readiness is edge-triggered: data that arrived while the
            // receiver was stopped produces no new event.
            self.dirty.push(id);
        }
        Ok(())
    }

    // ========================================================================
    // Event Loop
    // ========================================================================

    /// Drives all I/O once and appends the resulting events to `out`.
    ///
    /// Blocks for at most `timeout` (forever on `None`) unless events are
    /// already pending, or the waker fires.
    pub fn poll(
        &mut self,
        out: &mut Vec<TransportEvent>,
        timeout: Option<Duration>,
    ) -> NetResult<()> {
        self.service_dirty();

        let timeout = if self.pending.is_empty() && self.dirty.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        let tokens: Vec<Token> = self.events.iter().map(mio::event::Event::token).collect();
        for token in tokens {
            match token {
                LISTENER => self.accept_all(),
                WAKER => trace!("woken"),
                token => self.service(ConnectionId::from_token(token)),
            }
        }

        self.service_dirty();
        out.extend(self.pending.drain(..));
        Ok(())
    }

    fn service_dirty(&mut self) {
        let dirty = std::mem::take(&mut self.dirty);
        for id in dirty {
            self.service(id);
        }
    }

    fn accept_all(&mut self) {
        loop {
            let (mut stream, addr) = match self.server.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };

            if self.config.nodelay {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(peer = %addr, error = %e, "failed to disable nagle");
                }
            }

            let id = self.allocate_id();
            if let Err(e) = self.poll.registry().register(
                &mut stream,
                id.token(),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!(peer = %addr, error = %e, "failed to register accepted socket");
                continue;
            }

            match Connection::accepting(id, self.local.clone(), stream, self.config.buffer_size) {
                Ok(conn) => {
                    debug!(connection = %id, peer = %addr, "accepted");
                    self.connections.insert(id, conn);
                    self.dirty.push(id);
                }
                Err(e) => warn!(peer = %addr, error = %e, "dropping accepted socket"),
            }
        }
    }

    fn dial(&mut self, id: ConnectionId, remote: &ProcessId) -> NetResult<Connection> {
        let addr = resolve(remote)?;
        let mut stream = TcpStream::connect(addr)?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        self.poll.registry().register(
            &mut stream,
            id.token(),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(Connection::dialing(
            id,
            self.local.clone(),
            remote.clone(),
            stream,
            self.config.buffer_size,
        ))
    }

    /// Advances one connection and settles its fate.
    fn service(&mut self, id: ConnectionId) {
        let max_frame_size = self.config.max_frame_size;
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        let result = drive(conn, max_frame_size, &mut self.pending);
        match result {
            Ok(Liveness::Open) => {}
            Ok(Liveness::Closed) => {
                if let Some(mut conn) = self.connections.remove(&id) {
                    self.teardown(&mut conn);
                    let remote = conn.remote().cloned();
                    info!(connection = %id, remote = ?remote, "connection closed by peer");
                    self.pending.push_back(TransportEvent::Closed {
                        connection: id,
                        remote,
                    });
                }
            }
            Err(err) => {
                if let Some(mut conn) = self.connections.remove(&id) {
                    self.teardown(&mut conn);
                    let remote = conn.remote().cloned();
                    warn!(connection = %id, remote = ?remote, error = %err, "connection broken");
                    self.pending.push_back(TransportEvent::Broken {
                        connection: id,
                        remote,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    fn teardown(&self, conn: &mut Connection) {
        if let Some(stream) = conn.stream_mut() {
            if let Err(e) = self.poll.registry().deregister(stream) {
                trace!(connection = %conn.id(), error = %e, "deregister failed");
            }
        }
        conn.shutdown();
    }

    fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Dial completion, write, read, then write again for whatever the read
/// queued (the active side's handshake reply).
fn drive(
    conn: &mut Connection,
    max_frame_size: usize,
    out: &mut VecDeque<TransportEvent>,
) -> NetResult<Liveness> {
    if !conn.finish_dial()? {
        return Ok(Liveness::Open);
    }
    conn.flush(out)?;
    let liveness = conn.process_inbound(max_frame_size, out)?;
    if liveness == Liveness::Open {
        conn.flush(out)?;
    }
    Ok(liveness)
}

fn resolve(pid: &ProcessId) -> NetResult<SocketAddr> {
    (pid.address(), pid.port())
        .to_socket_addrs()
        .map_err(|source| NetError::Resolve {
            pid: pid.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| NetError::Unresolvable(pid.clone()))
}
