//! Runtime error types.

use cohort_config::ConfigError;
use cohort_membership::MembershipError;
use cohort_net::NetError;
use cohort_order::OrderError;
use thiserror::Error;

/// Result type for runtime operations.
pub type StackResult<T> = Result<T, StackError>;

/// Errors surfaced by [`Runtime::spawn`](crate::Runtime::spawn) and the
/// [`StackHandle`](crate::StackHandle) operations.
#[derive(Debug, Error)]
pub enum StackError {
    /// Transport error.
    #[error("transport error: {0}")]
    Net(#[from] NetError),

    /// FIFO or causal layer rejected the operation.
    #[error("ordering error: {0}")]
    Order(#[from] OrderError),

    /// Membership layer rejected the operation.
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Envelope could not be encoded or decoded.
    #[error("envelope codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// I/O error (thread spawn, waker).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The command queue is full.
    #[error("stack busy: command queue holds {0} commands")]
    Busy(usize),

    /// A blocking operation was called from an event handler, which runs on
    /// the stack thread that would have to complete it.
    #[error("blocking call from the stack thread")]
    OnStackThread,

    /// The stack thread has stopped or is stopping.
    #[error("stack shut down")]
    Shutdown,
}

impl StackError {
    /// Returns true if the operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}
