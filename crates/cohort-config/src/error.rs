//! Configuration error types

use cohort_types::TypesError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid process id {value:?} in configuration: {source}")]
    InvalidProcessId { value: String, source: TypesError },

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("XDG directory error: {0}")]
    XdgError(String),
}
