//! # cohort: Process-group communication
//!
//! Runs the Cohort protocol stack for one process: a reliable framed
//! transport, FIFO and causal delivery ordering, and group membership, all
//! driven by a single `cohort-stack` thread.
//!
//! # Quick Start
//!
//! ```ignore
//! use cohort::{Destinations, EventHandlers, ProcessId, Runtime, StackConfig};
//!
//! let local = ProcessId::new("127.0.0.1", 7400, 0);
//! let config = StackConfig::new(local.clone(), vec![local]);
//! let handlers = EventHandlers::new()
//!     .on_causal_delivered(|source, payload| println!("{source}: {payload:?}"))
//!     .on_new_view(|view| println!("view {view}"));
//!
//! let stack = Runtime::spawn(config, handlers)?;
//! stack.causal_send("hello", Destinations::View)?;
//! stack.shutdown();
//! ```
//!
//! # Membership agreement
//!
//! Membership changes need a total-order primitive this crate does not
//! provide. [`StackHandle::join`] and [`StackHandle::remove`] surface the
//! request as [`StackEvent::Abcast`]; whatever orders those requests feeds
//! the agreed sequence back to every member through
//! [`StackHandle::adeliver`].

mod bounded_queue;
mod envelope;
mod error;
mod events;
mod handle;
mod peers;
mod runtime;


pub use envelope::Envelope;
pub use error::{StackError, StackResult};
pub use events::{EventHandlers, StackEvent};
pub use handle::{Destinations, StackHandle};
pub use runtime::{Runtime, StackConfig};

// Re-export the types applications need alongside the runtime.
pub use cohort_membership::{MembershipOp, View};
pub use cohort_types::{ProcessId, ViewId};
