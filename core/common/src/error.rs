//! Common error types for Stowage.

use thiserror::Error;

/// Top-level error type for storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not implemented by the selected backend.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Mutating call against a read-only disk.
    #[error("Read-only: {0}")]
    ReadOnly(String),

    /// Connection or protocol failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credentials rejected or expired.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Backend refused access to an existing resource.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Upload rejected by a validation rule.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Conflict detected (e.g. ambiguous name lookup).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classification shared by every driver.
///
/// Mapping to HTTP status codes (or anything else) can be written once
/// against this enum instead of per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Unsupported,
    ReadOnlyViolation,
    TransportFailure,
    ValidationFailure,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Io(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                ErrorKind::NotFound
            }
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::ReadOnly(_) => ErrorKind::ReadOnlyViolation,
            Error::Transport(_)
            | Error::Authentication(_)
            | Error::PermissionDenied(_)
            | Error::Io(_) => ErrorKind::TransportFailure,
            Error::Validation(_)
            | Error::InvalidInput(_)
            | Error::AlreadyExists(_)
            | Error::Conflict(_)
            | Error::Serialization(_) => ErrorKind::ValidationFailure,
        }
    }

    /// Shorthand for `kind() == ErrorKind::NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Build an `Unsupported` error naming the backend and operation.
    pub fn unsupported(backend: &str, operation: &str) -> Self {
        Error::Unsupported(format!(
            "{} is not supported by the {} driver",
            operation, backend
        ))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_classifies_as_not_found() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());

        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
    }

    #[test]
    fn test_taxonomy() {
        assert_eq!(Error::ReadOnly("x".into()).kind(), ErrorKind::ReadOnlyViolation);
        assert_eq!(
            Error::Authentication("x".into()).kind(),
            ErrorKind::TransportFailure
        );
        assert_eq!(Error::Validation("x".into()).kind(), ErrorKind::ValidationFailure);
        assert_eq!(Error::unsupported("ftp", "url").kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_unsupported_message_names_backend() {
        let err = Error::unsupported("buffer", "temporary_url");
        assert!(err.to_string().contains("buffer"));
        assert!(err.to_string().contains("temporary_url"));
    }
}
