//! # cohort-membership: Group views
//!
//! Maintains the current view of the group (ordered member list plus a
//! monotonic [`ViewId`]) and turns join/remove requests into view changes.
//!
//! Agreement is not done here. A request leaves the layer as an
//! [`MembershipOp`] to be broadcast by an external total-order primitive;
//! every member feeds the agreed operations back through
//! [`MembershipLayer::adeliver`] in the same order, so every member computes
//! the same sequence of views.
//!
//! ```text
//! join(P4) ──► Abcast(Add(P4)) ──► [total order] ──► adeliver(Add(P4))
//!                                                         │
//!                                      view v3 {P1,P2,P3,P4}, state ──► P4
//! ```
//!
//! A process that starts with an empty initial view waits for a
//! [`StateTransfer`] from a member before it applies anything.

use std::fmt::Display;

use cohort_types::{ProcessId, ViewId};
use serde::{Deserialize, Serialize};

mod error;
mod layer;


pub use error::{MembershipError, MembershipResult};
pub use layer::MembershipLayer;

// ============================================================================
// Operations
// ============================================================================

/// A membership change submitted for agreement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipOp {
    Add(ProcessId),
    Remove(ProcessId),
}

impl MembershipOp {
    pub fn process(&self) -> &ProcessId {
        match self {
            Self::Add(pid) | Self::Remove(pid) => pid,
        }
    }
}

impl Display for MembershipOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add(pid) => write!(f, "add {pid}"),
            Self::Remove(pid) => write!(f, "remove {pid}"),
        }
    }
}

// ============================================================================
// Views
// ============================================================================

/// An agreed member list. Never contains a process twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    id: ViewId,
    members: Vec<ProcessId>,
}

impl View {
    pub(crate) fn new(id: ViewId, members: Vec<ProcessId>) -> Self {
        Self { id, members }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn members(&self) -> &[ProcessId] {
        &self.members
    }

    pub fn contains(&self, pid: &ProcessId) -> bool {
        self.members.contains(pid)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The member that sends state to a joiner: the first member.
    pub fn sponsor(&self) -> Option<&ProcessId> {
        self.members.first()
    }
}

impl Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {{", self.id)?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{member}")?;
        }
        write!(f, "}}")
    }
}

/// View state sent to a process that joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransfer {
    pub view_id: ViewId,
    pub members: Vec<ProcessId>,
    /// The processes this transfer introduces to the group.
    pub added: Vec<ProcessId>,
}

// ============================================================================
// Output
// ============================================================================

/// Instructions for the transport underneath the membership layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipDirective {
    /// The full member list, on first adopting a view.
    JoinList(Vec<ProcessId>),
    Added(ProcessId),
    Removed(ProcessId),
}

/// A state transfer addressed to one process, possibly not yet connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTo {
    pub destination: ProcessId,
    pub transfer: StateTransfer,
}

/// Output produced by the membership layer.
///
/// The caller (runtime) is responsible for:
/// 1. Submitting `abcast` operations to the total-order primitive
/// 2. Sending `transfers` point-to-point
/// 3. Applying `directives` to the transport
/// 4. Announcing `new_views` upward, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipOutput {
    pub abcast: Vec<MembershipOp>,
    pub transfers: Vec<TransferTo>,
    pub directives: Vec<MembershipDirective>,
    pub new_views: Vec<View>,
}

impl MembershipOutput {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.abcast.is_empty()
            && self.transfers.is_empty()
            && self.directives.is_empty()
            && self.new_views.is_empty()
    }

    /// Merges another output into this one, preserving order.
    pub fn merge(&mut self, other: MembershipOutput) {
        self.abcast.extend(other.abcast);
        self.transfers.extend(other.transfers);
        self.directives.extend(other.directives);
        self.new_views.extend(other.new_views);
    }
}
