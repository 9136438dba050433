//! Ordering layer error types.

use cohort_types::ProcessId;
use thiserror::Error;

use crate::causal::CausalRequest;

/// Result type for ordering layer operations.
pub type OrderResult<T> = Result<T, OrderError>;

/// Errors shared by the FIFO and causal layers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    /// A member list names the same process twice.
    #[error("duplicate member in view: {0}")]
    DuplicateMember(ProcessId),

    /// An operation other than `init` was called first.
    #[error("layer is not initialized")]
    NotInitialized,

    /// `init` was called twice; later changes go through `apply_view`.
    #[error("layer is already initialized")]
    AlreadyInitialized,

    /// A destination or source outside the current member list.
    #[error("unknown process: {0}")]
    UnknownProcess(ProcessId),

    /// A send with no destinations.
    #[error("send has no destinations")]
    NoDestinations,

    /// The reorder buffer for one source reached its bound.
    #[error("reorder buffer for {source_pid} is full ({limit} packets)")]
    ReorderBufferFull { source_pid: ProcessId, limit: usize },
}

/// Errors of the causal send path.
#[derive(Debug, Error)]
pub enum CausalError {
    /// Too many messages outstanding. The request is handed back so the
    /// caller can retry it once capacity frees.
    #[error("causal send window is full ({outstanding} outstanding)")]
    WindowFull {
        outstanding: usize,
        request: CausalRequest,
    },

    #[error(transparent)]
    Order(#[from] OrderError),
}

impl CausalError {
    /// Returns true if retrying later can succeed.
    pub fn is_window_full(&self) -> bool {
        matches!(self, Self::WindowFull { .. })
    }

    /// Takes back the rejected request, if this is `WindowFull`.
    pub fn into_request(self) -> Option<CausalRequest> {
        match self {
            Self::WindowFull { request, .. } => Some(request),
            Self::Order(_) => None,
        }
    }
}
