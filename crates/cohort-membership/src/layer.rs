//! The membership state machine.

use std::collections::VecDeque;

use cohort_types::{ProcessId, ViewId, find_duplicate};
use tracing::{debug, info, warn};

use crate::error::{MembershipError, MembershipResult};
use crate::{
    MembershipDirective, MembershipOp, MembershipOutput, StateTransfer, TransferTo, View,
};

/// Tracks the current view of one process.
///
/// Construction and initialization are distinct: a joining process exists
/// (and buffers agreed operations) before it has any view data.
#[derive(Debug)]
pub struct MembershipLayer {
    local: ProcessId,
    view: Option<View>,
    /// Agreed operations that arrived before the first view, oldest first.
    pending_adeliver: VecDeque<MembershipOp>,
}

impl MembershipLayer {
    pub fn new(local: ProcessId) -> Self {
        Self {
            local,
            view: None,
            pending_adeliver: VecDeque::new(),
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Adopts `initial` as view zero.
    ///
    /// An empty list leaves the layer waiting for a state transfer.
    pub fn init(&mut self, initial: &[ProcessId]) -> MembershipResult<MembershipOutput> {
        if self.view.is_some() {
            return Err(MembershipError::AlreadyInitialized);
        }
        if initial.is_empty() {
            debug!(pid = %self.local, "no initial view, awaiting state transfer");
            return Ok(MembershipOutput::empty());
        }

        let mut output = MembershipOutput::empty();
        self.adopt(ViewId::ZERO, initial.to_vec(), &mut output)?;
        Ok(output)
    }

    /// Requests that `pid` be added. Agreement is external.
    pub fn join(&self, pid: ProcessId) -> MembershipOutput {
        MembershipOutput {
            abcast: vec![MembershipOp::Add(pid)],
            ..MembershipOutput::default()
        }
    }

    /// Requests that `pid` be removed. Agreement is external.
    pub fn remove(&self, pid: ProcessId) -> MembershipOutput {
        MembershipOutput {
            abcast: vec![MembershipOp::Remove(pid)],
            ..MembershipOutput::default()
        }
    }

    /// Adopts the view carried by a state transfer, then replays the agreed
    /// operations buffered while waiting for it that came after the one
    /// adding this process.
    ///
    /// Ignored once the layer has a view.
    pub fn deliver_state(
        &mut self,
        from: &ProcessId,
        transfer: StateTransfer,
    ) -> MembershipResult<MembershipOutput> {
        if self.view.is_some() {
            debug!(from = %from, view_id = %transfer.view_id, "ignoring state transfer, already initialized");
            return Ok(MembershipOutput::empty());
        }

        let mut output = MembershipOutput::empty();
        self.adopt(transfer.view_id, transfer.members.clone(), &mut output)?;
        info!(from = %from, view_id = %transfer.view_id, "state transfer received");

        for other in transfer.added.iter().filter(|p| **p != self.local) {
            output.transfers.push(TransferTo {
                destination: other.clone(),
                transfer: transfer.clone(),
            });
        }

        // The transferred view already reflects every agreed operation up to
        // the one that added its recipients.
        let covered = transfer
            .added
            .iter()
            .filter_map(|added| {
                self.pending_adeliver
                    .iter()
                    .position(|op| matches!(op, MembershipOp::Add(pid) if pid == added))
            })
            .max();
        if let Some(last) = covered {
            let skipped = self.pending_adeliver.drain(..=last).count();
            debug!(skipped, view_id = %transfer.view_id, "dropping agreed operations covered by the state transfer");
        }

        while let Some(op) = self.pending_adeliver.pop_front() {
            self.apply(op, &mut output);
        }
        Ok(output)
    }

    /// Applies one agreed operation.
    ///
    /// Before the first view, operations are buffered and replayed by
    /// [`MembershipLayer::deliver_state`].
    pub fn adeliver(&mut self, op: MembershipOp) -> MembershipOutput {
        let mut output = MembershipOutput::empty();
        if self.view.is_none() {
            debug!(op = %op, "buffering agreed operation until a view arrives");
            self.pending_adeliver.push_back(op);
        } else {
            self.apply(op, &mut output);
        }
        output
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn local(&self) -> &ProcessId {
        &self.local
    }

    pub fn view(&self) -> Option<&View> {
        self.view.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.view.is_some()
    }

    pub fn pending_adeliver_len(&self) -> usize {
        self.pending_adeliver.len()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn adopt(
        &mut self,
        id: ViewId,
        members: Vec<ProcessId>,
        output: &mut MembershipOutput,
    ) -> MembershipResult<()> {
        if let Some(pid) = find_duplicate(&members) {
            return Err(MembershipError::DuplicateMember(pid.clone()));
        }

        let view = View::new(id, members);
        info!(pid = %self.local, view = %view, "view installed");
        output
            .directives
            .push(MembershipDirective::JoinList(view.members().to_vec()));
        output.new_views.push(view.clone());
        self.view = Some(view);
        Ok(())
    }

    fn apply(&mut self, op: MembershipOp, output: &mut MembershipOutput) {
        let Some(view) = self.view.as_mut() else {
            return;
        };

        match op {
            MembershipOp::Add(pid) => {
                if view.contains(&pid) {
                    warn!(pid = %pid, view_id = %view.id, "ignoring add of existing member");
                    return;
                }
                let sponsor = view.sponsor().cloned();
                view.members.push(pid.clone());
                view.id = view.id.next();
                info!(added = %pid, view = %view, "member added");

                output
                    .directives
                    .push(MembershipDirective::Added(pid.clone()));
                if sponsor.as_ref() == Some(&self.local) {
                    output.transfers.push(TransferTo {
                        destination: pid.clone(),
                        transfer: StateTransfer {
                            view_id: view.id,
                            members: view.members.clone(),
                            added: vec![pid],
                        },
                    });
                } else if sponsor.is_none() {
                    warn!(added = %pid, "added to an empty view, no sponsor sends state");
                }
                output.new_views.push(view.clone());
            }
            MembershipOp::Remove(pid) => {
                let Some(position) = view.members.iter().position(|m| *m == pid) else {
                    debug!(pid = %pid, "ignoring remove of non-member");
                    return;
                };
                view.members.remove(position);
                view.id = view.id.next();
                info!(removed = %pid, view = %view, "member removed");

                output
                    .directives
                    .push(MembershipDirective::Removed(pid));
                output.new_views.push(view.clone());
            }
        }
    }
}
