//! Error types for core type parsing and validation.

use thiserror::Error;

use crate::ProcessId;

/// Result type for type-level operations.
pub type TypesResult<T> = Result<T, TypesError>;

/// Errors produced while parsing, decoding or validating core types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// A process id string was not `host:port:incarnation`.
    #[error("invalid process id: {0:?} (expected host:port:incarnation)")]
    InvalidProcessId(String),

    /// A member list contained the same process twice.
    #[error("duplicate member in view: {0}")]
    DuplicateMember(ProcessId),

    /// Handshake hostname was not valid UTF-8.
    #[error("handshake hostname is not valid UTF-8")]
    InvalidHostname,

    /// Handshake hostname length exceeds the limit.
    #[error("handshake hostname too long: {len} bytes (max {max})")]
    HostnameTooLong { len: usize, max: usize },

    /// Handshake port does not fit in 16 bits.
    #[error("handshake port out of range: {0}")]
    PortOutOfRange(u32),
}
