//! Upward events and the closures that receive them.

use bytes::Bytes;
use cohort_membership::{MembershipOp, View};
use cohort_types::ProcessId;

/// Everything the stack reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// A FIFO-ordered payload from `source`.
    FifoDelivered { source: ProcessId, payload: Bytes },

    /// A causally ordered payload from `source`.
    CausalDelivered { source: ProcessId, payload: Bytes },

    /// The membership layer installed a view.
    NewView(View),

    /// A membership change to be agreed on by the total-order primitive.
    ///
    /// The application broadcasts it and feeds the agreed order back through
    /// [`StackHandle::adeliver`](crate::StackHandle::adeliver) on every member.
    Abcast(MembershipOp),

    /// First established connection to `pid`.
    PeerUp(ProcessId),

    /// The established connection to `pid` closed or broke.
    PeerDown { pid: ProcessId, reason: String },
}

type Callback<T> = Box<dyn FnMut(T) + Send>;

/// One optional closure per event kind, all invoked on the stack thread.
///
/// Closures must not block: the transport is not polled while one runs.
/// Events without a closure are dropped.
///
/// # Examples
///
/// ```
/// # use cohort::EventHandlers;
/// let handlers = EventHandlers::new()
///     .on_causal_delivered(|source, payload| println!("{source}: {payload:?}"))
///     .on_new_view(|view| println!("installed {view}"));
/// # drop(handlers);
/// ```
#[derive(Default)]
pub struct EventHandlers {
    fifo_delivered: Option<Callback<(ProcessId, Bytes)>>,
    causal_delivered: Option<Callback<(ProcessId, Bytes)>>,
    new_view: Option<Callback<View>>,
    abcast: Option<Callback<MembershipOp>>,
    peer_up: Option<Callback<ProcessId>>,
    peer_down: Option<Callback<(ProcessId, String)>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes every event to one closure.
    pub fn forward_all<F>(f: F) -> Self
    where
        F: FnMut(StackEvent) + Send + Clone + 'static,
    {
        let mut fifo = f.clone();
        let mut causal = f.clone();
        let mut view = f.clone();
        let mut abcast = f.clone();
        let mut up = f.clone();
        let mut down = f;
        Self::new()
            .on_fifo_delivered(move |source, payload| {
                fifo(StackEvent::FifoDelivered { source, payload });
            })
            .on_causal_delivered(move |source, payload| {
                causal(StackEvent::CausalDelivered { source, payload });
            })
            .on_new_view(move |v| view(StackEvent::NewView(v)))
            .on_abcast(move |op| abcast(StackEvent::Abcast(op)))
            .on_peer_up(move |pid| up(StackEvent::PeerUp(pid)))
            .on_peer_down(move |pid, reason| down(StackEvent::PeerDown { pid, reason }))
    }

    pub fn on_fifo_delivered(
        mut self,
        mut f: impl FnMut(ProcessId, Bytes) + Send + 'static,
    ) -> Self {
        self.fifo_delivered = Some(Box::new(move |(source, payload)| f(source, payload)));
        self
    }

    pub fn on_causal_delivered(
        mut self,
        mut f: impl FnMut(ProcessId, Bytes) + Send + 'static,
    ) -> Self {
        self.causal_delivered = Some(Box::new(move |(source, payload)| f(source, payload)));
        self
    }

    pub fn on_new_view(mut self, f: impl FnMut(View) + Send + 'static) -> Self {
        self.new_view = Some(Box::new(f));
        self
    }

    pub fn on_abcast(mut self, f: impl FnMut(MembershipOp) + Send + 'static) -> Self {
        self.abcast = Some(Box::new(f));
        self
    }

    pub fn on_peer_up(mut self, f: impl FnMut(ProcessId) + Send + 'static) -> Self {
        self.peer_up = Some(Box::new(f));
        self
    }

    pub fn on_peer_down(mut self, mut f: impl FnMut(ProcessId, String) + Send + 'static) -> Self {
        self.peer_down = Some(Box::new(move |(pid, reason)| f(pid, reason)));
        self
    }

    /// Hands `event` to its closure, if one is registered.
    pub fn dispatch(&mut self, event: StackEvent) {
        match event {
            StackEvent::FifoDelivered { source, payload } => {
                if let Some(f) = self.fifo_delivered.as_mut() {
                    f((source, payload));
                }
            }
            StackEvent::CausalDelivered { source, payload } => {
                if let Some(f) = self.causal_delivered.as_mut() {
                    f((source, payload));
                }
            }
            StackEvent::NewView(view) => {
                if let Some(f) = self.new_view.as_mut() {
                    f(view);
                }
            }
            StackEvent::Abcast(op) => {
                if let Some(f) = self.abcast.as_mut() {
                    f(op);
                }
            }
            StackEvent::PeerUp(pid) => {
                if let Some(f) = self.peer_up.as_mut() {
                    f(pid);
                }
            }
            StackEvent::PeerDown { pid, reason } => {
                if let Some(f) = self.peer_down.as_mut() {
                    f((pid, reason));
                }
            }
        }
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("fifo_delivered", &self.fifo_delivered.is_some())
            .field("causal_delivered", &self.causal_delivered.is_some())
            .field("new_view", &self.new_view.is_some())
            .field("abcast", &self.abcast.is_some())
            .field("peer_up", &self.peer_up.is_some())
            .field("peer_down", &self.peer_down.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn unregistered_events_are_dropped() {
        let (tx, rx) = mpsc::channel();
        let mut handlers = EventHandlers::new().on_abcast(move |op| tx.send(op).unwrap());
        let pid = ProcessId::new("a", 1, 0);

        handlers.dispatch(StackEvent::PeerUp(pid.clone()));
        handlers.dispatch(StackEvent::Abcast(MembershipOp::Add(pid.clone())));

        assert_eq!(rx.try_recv().unwrap(), MembershipOp::Add(pid));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn forward_all_preserves_dispatch_order() {
        let (tx, rx) = mpsc::channel();
        let mut handlers = EventHandlers::forward_all(move |event| {
            let _ = tx.send(event);
        });
        let pid = ProcessId::new("a", 1, 0);
        let events = vec![
            StackEvent::PeerUp(pid.clone()),
            StackEvent::FifoDelivered {
                source: pid.clone(),
                payload: Bytes::from_static(b"x"),
            },
            StackEvent::PeerDown {
                pid,
                reason: "eof".to_string(),
            },
        ];

        for event in events.clone() {
            handlers.dispatch(event);
        }
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), events);
    }
}
