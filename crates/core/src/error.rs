//! Error types for the ModelServe control plane

use thiserror::Error;

/// Result type alias for ModelServe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the ModelServe control plane
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration or request (bad batching parameters,
    /// zero-size requests, mismatched batch dimensions)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is illegal in the object's current state (e.g. changing the
    /// polling period once polling has started)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A required collaborator was missing at construction time
    #[error("Internal error: {0}")]
    Internal(String),

    /// Something expected on disk or in a registry was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Admission control refused the request (queue full, scheduler closed)
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The execution session failed while running a batch
    #[error("Execution error: {0}")]
    Execution(String),

    /// The request was abandoned before a result was produced
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration loading error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parse error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create an unavailable (admission control) error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    /// Create an execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Error::Execution(msg.into())
    }

    /// True for errors raised while validating configuration
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::InvalidState(_) | Error::Config(_)
        )
    }

    /// True when the request was rejected by admission control rather than
    /// failing during execution
    pub fn is_admission_failure(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    /// Produce an owned copy suitable for fanning one failure out to many
    /// waiters. Source errors that are not `Clone` are flattened to strings.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Error::InvalidArgument(m) => Error::InvalidArgument(m.clone()),
            Error::InvalidState(m) => Error::InvalidState(m.clone()),
            Error::Internal(m) => Error::Internal(m.clone()),
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::Unavailable(m) => Error::Unavailable(m.clone()),
            Error::Execution(m) => Error::Execution(m.clone()),
            Error::Cancelled(m) => Error::Cancelled(m.clone()),
            Error::Config(m) => Error::Config(m.clone()),
            other => Error::Execution(other.to_string()),
        }
    }
}
