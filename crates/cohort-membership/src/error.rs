//! Membership error types.

use cohort_types::ProcessId;
use thiserror::Error;

/// Result type for membership operations.
pub type MembershipResult<T> = Result<T, MembershipError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MembershipError {
    /// A view names the same process twice.
    #[error("duplicate member in view: {0}")]
    DuplicateMember(ProcessId),

    /// `init` called on a layer that already has a view.
    #[error("membership layer is already initialized")]
    AlreadyInitialized,
}
