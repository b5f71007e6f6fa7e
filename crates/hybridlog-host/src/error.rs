//! Errors surfaced to the host.

use thiserror::Error;

use hybridlog_core::HybridError;

/// Host-facing error: engine failures plus provider lookup problems.
#[derive(Debug, Error)]
pub enum HostError {
    /// The storage engine rejected or failed an operation
    #[error("Storage engine error: {0}")]
    Engine(#[from] HybridError),

    /// No provider registered under this name
    #[error("Unknown store provider: {0}")]
    UnknownProvider(String),

    /// A provider with this name is already registered
    #[error("Store provider already registered: {0}")]
    DuplicateProvider(String),
}

impl HostError {
    /// The engine error behind this one, if any.
    pub fn engine(&self) -> Option<&HybridError> {
        match self {
            HostError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;
