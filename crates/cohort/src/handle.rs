//! The application-facing side of a running stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use cohort_membership::{MembershipOp, View};
use cohort_types::ProcessId;
use mio::Waker;
use tracing::{debug, warn};

use crate::bounded_queue::{BoundedQueue, PushResult};
use crate::error::{StackError, StackResult};

/// How long a blocked caller sleeps before rechecking that the stack thread
/// is still alive.
const LIVENESS_CHECK: Duration = Duration::from_millis(100);

/// Who a send is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Destinations {
    /// Every member of the current view, the local process included.
    #[default]
    View,
    /// An explicit list; every entry must be a member of the current view.
    Processes(Vec<ProcessId>),
}

impl From<Vec<ProcessId>> for Destinations {
    fn from(processes: Vec<ProcessId>) -> Self {
        Self::Processes(processes)
    }
}

impl From<&[ProcessId]> for Destinations {
    fn from(processes: &[ProcessId]) -> Self {
        Self::Processes(processes.to_vec())
    }
}

/// A request from an application thread to the stack thread.
#[derive(Debug)]
pub(crate) enum Command {
    FifoSend {
        payload: Bytes,
        to: Destinations,
    },
    CausalSend {
        payload: Bytes,
        to: Destinations,
        admitted: Completion<()>,
    },
    Join(ProcessId),
    Remove(ProcessId),
    Adeliver(MembershipOp),
    View(Completion<Option<View>>),
}

impl Command {
    /// Fails whoever is waiting on this command.
    pub(crate) fn abandon(self) {
        match self {
            Self::CausalSend { admitted, .. } => admitted.complete(Err(StackError::Shutdown)),
            Self::View(reply) => reply.complete(Err(StackError::Shutdown)),
            Self::FifoSend { .. } | Self::Join(_) | Self::Remove(_) | Self::Adeliver(_) => {}
        }
    }
}

// ============================================================================
// Completion
// ============================================================================

/// One-shot result slot a caller blocks on until the stack thread fills it.
#[derive(Debug)]
pub(crate) struct Completion<T> {
    slot: Arc<(Mutex<Option<StackResult<T>>>, Condvar)>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    pub(crate) fn complete(&self, result: StackResult<T>) {
        let (lock, cvar) = &*self.slot;
        let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(result);
            cvar.notify_all();
        }
    }

    /// Blocks until the slot is filled, or fails with
    /// [`StackError::Shutdown`] once the stack thread has exited without
    /// filling it.
    fn wait(&self, shared: &Shared) -> StackResult<T> {
        let (lock, cvar) = &*self.slot;
        let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            if shared.exited.load(Ordering::Acquire) {
                return Err(StackError::Shutdown);
            }
            slot = cvar
                .wait_timeout(slot, LIVENESS_CHECK)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// State shared by every handle and the stack thread.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) local: ProcessId,
    pub(crate) commands: BoundedQueue<Command>,
    pub(crate) waker: Arc<Waker>,
    /// Set by `shutdown`; the stack thread exits at the top of its loop.
    pub(crate) stopping: AtomicBool,
    /// Set by the stack thread after it has failed every queued command.
    pub(crate) exited: AtomicBool,
    pub(crate) thread: Mutex<Option<JoinHandle<()>>>,
    /// Set by the stack thread before it runs any handler.
    pub(crate) stack_thread: OnceLock<ThreadId>,
}

impl Shared {
    pub(crate) fn new(local: ProcessId, capacity: usize, waker: Arc<Waker>) -> Self {
        Self {
            local,
            commands: BoundedQueue::new(capacity),
            waker,
            stopping: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            thread: Mutex::new(None),
            stack_thread: OnceLock::new(),
        }
    }

    pub(crate) fn on_stack_thread(&self) -> bool {
        self.stack_thread.get() == Some(&thread::current().id())
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running stack.
///
/// Every operation is queued for the stack thread. A full queue fails with
/// [`StackError::Busy`] instead of blocking; only
/// [`StackHandle::causal_send`] and [`StackHandle::view`] wait for the stack
/// thread.
#[derive(Debug, Clone)]
pub struct StackHandle {
    shared: Arc<Shared>,
}

impl StackHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// The local identity, with the port the listener is bound to.
    pub fn local_pid(&self) -> &ProcessId {
        &self.shared.local
    }

    /// Returns true until [`StackHandle::shutdown`] is called or the stack
    /// thread stops.
    pub fn is_running(&self) -> bool {
        !self.shared.stopping.load(Ordering::Acquire)
    }

    /// Sends `payload` in FIFO order.
    ///
    /// Returns once the send is queued. Layer errors (unknown destination,
    /// no view yet) are logged by the stack thread.
    pub fn fifo_send(&self, payload: impl Into<Bytes>, to: impl Into<Destinations>) -> StackResult<()> {
        self.submit(Command::FifoSend {
            payload: payload.into(),
            to: to.into(),
        })
    }

    /// Sends `payload` in causal order.
    ///
    /// Blocks while the causal send window is full, and returns once the
    /// layer has admitted the message. Layer errors are returned.
    ///
    /// Fails with [`StackError::OnStackThread`] from inside an event handler.
    pub fn causal_send(&self, payload: impl Into<Bytes>, to: impl Into<Destinations>) -> StackResult<()> {
        self.ensure_off_stack_thread()?;
        let admitted = Completion::new();
        self.submit(Command::CausalSend {
            payload: payload.into(),
            to: to.into(),
            admitted: admitted.clone(),
        })?;
        admitted.wait(&self.shared)
    }

    /// Asks the group to add `pid`. The request leaves as
    /// [`StackEvent::Abcast`](crate::StackEvent::Abcast).
    pub fn join(&self, pid: ProcessId) -> StackResult<()> {
        self.submit(Command::Join(pid))
    }

    /// Asks the group to remove `pid`. The request leaves as
    /// [`StackEvent::Abcast`](crate::StackEvent::Abcast).
    pub fn remove(&self, pid: ProcessId) -> StackResult<()> {
        self.submit(Command::Remove(pid))
    }

    /// Feeds one agreed membership operation, in the agreed order.
    pub fn adeliver(&self, op: MembershipOp) -> StackResult<()> {
        self.submit(Command::Adeliver(op))
    }

    /// The current view, or `None` while waiting for a state transfer.
    ///
    /// Fails with [`StackError::OnStackThread`] from inside an event handler.
    pub fn view(&self) -> StackResult<Option<View>> {
        self.ensure_off_stack_thread()?;
        let reply = Completion::new();
        self.submit(Command::View(reply.clone()))?;
        reply.wait(&self.shared)
    }

    /// Stops the stack thread and waits for it to exit.
    ///
    /// Queued commands are dropped and blocked callers fail with
    /// [`StackError::Shutdown`]. Safe to call more than once and from
    /// inside an event handler (which then does not wait).
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "failed to wake stack thread");
        }

        if self.shared.on_stack_thread() {
            return;
        }
        let handle = self
            .shared
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
            debug!(pid = %self.shared.local, "stack thread joined");
        }
    }

    fn ensure_off_stack_thread(&self) -> StackResult<()> {
        if self.shared.on_stack_thread() {
            return Err(StackError::OnStackThread);
        }
        Ok(())
    }

    fn submit(&self, command: Command) -> StackResult<()> {
        if !self.is_running() {
            return Err(StackError::Shutdown);
        }
        match self.shared.commands.try_push(command) {
            PushResult::Ok => {}
            PushResult::Backpressure(_) => {
                return Err(StackError::Busy(self.shared.commands.capacity()));
            }
        }
        self.shared.waker.wake()?;
        Ok(())
    }
}
