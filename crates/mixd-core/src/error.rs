//! Error types for mixd.

use thiserror::Error;

/// Result type alias using mixd's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mixd.
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    // Driver / backend errors
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Allocation failed: {0}")]
    NoMemory(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Endpoint link limit reached ({0} streams)")]
    LinkLimitReached(usize),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidParam`].
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Shorthand for [`Error::IllegalState`].
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Shorthand for [`Error::OperationFailed`].
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Returns true if this error was raised by parameter validation.
    pub const fn is_invalid_param(&self) -> bool {
        matches!(self, Self::InvalidParam(_))
    }

    /// Returns true if the operation was rejected for the current status.
    pub const fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_))
    }

    /// Returns true if retrying the operation later may succeed.
    ///
    /// Driver failures leave the endpoint stopped until a new link restarts
    /// it, so a client can retry after those.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed(_) | Self::IllegalState(_) | Self::LinkLimitReached(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::operation_failed("sink start").is_retryable());
        assert!(Error::LinkLimitReached(10).is_retryable());
        assert!(!Error::invalid_param("span 0").is_retryable());
        assert!(!Error::NoMemory("buffer".into()).is_retryable());
    }

    #[test]
    fn test_error_kind_predicates() {
        assert!(Error::invalid_param("x").is_invalid_param());
        assert!(Error::illegal_state("x").is_illegal_state());
        assert!(!Error::illegal_state("x").is_invalid_param());
    }

    #[test]
    fn test_error_display() {
        let err = Error::invalid_param("total frames 999 not a multiple of span 1000");
        assert_eq!(
            err.to_string(),
            "Invalid parameter: total frames 999 not a multiple of span 1000"
        );
        assert_eq!(
            Error::LinkLimitReached(10).to_string(),
            "Endpoint link limit reached (10 streams)"
        );
    }
}
