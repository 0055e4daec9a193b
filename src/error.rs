//! Error types for the memory engine.
//!
//! Every fallible library operation returns [`Result`]. Each [`Error`]
//! maps onto one of five [`ErrorKind`]s so callers can decide whether to
//! retry, report, or fall back without matching on individual variants.

use thiserror::Error;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The named document, section, or item does not exist.
    NotFound,
    /// Malformed input: unknown category, bad mode, invalid limit.
    Validation,
    /// Store or embedding provider temporarily unreachable. Retryable.
    Transient,
    /// Store and files disagree in a way that needs operator attention.
    Inconsistent,
    /// A capability is missing and the operation could not fall back.
    Degraded,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation_error",
            ErrorKind::Transient => "transient",
            ErrorKind::Inconsistent => "inconsistent",
            ErrorKind::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("degraded: {0}")]
    Degraded(String),

    /// A synchronization failure, tagged with the document path.
    #[error("sync failed for {path}: {source}")]
    Sync {
        path: String,
        #[source]
        source: Box<Error>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Inconsistent(_) => ErrorKind::Inconsistent,
            Error::Degraded(_) => ErrorKind::Degraded,
            Error::Sync { source, .. } => source.kind(),
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Error::Io(_) => ErrorKind::Transient,
            Error::Database(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            Error::Database(_) => ErrorKind::Transient,
            Error::Serialization(_) => ErrorKind::Inconsistent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Attach the document path to a failure raised while syncing it.
    pub fn for_path(self, path: &str) -> Error {
        match self {
            Error::Sync { .. } => self,
            other => Error::Sync {
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::Degraded("x".into()).kind(), ErrorKind::Degraded);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::Io(io).kind(), ErrorKind::NotFound);
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(Error::Io(io).kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Transient("store down".into()).is_retryable());
        assert!(!Error::Validation("bad mode".into()).is_retryable());
        assert!(!Error::Inconsistent("drift".into()).is_retryable());
    }

    #[test]
    fn test_sync_error_keeps_kind_and_path() {
        let err = Error::Transient("provider timeout".into()).for_path("projects/a.md");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("projects/a.md"));
        assert!(msg.contains("provider timeout"));

        // Re-tagging keeps the innermost path.
        let again = err.for_path("other.md");
        assert!(again.to_string().contains("projects/a.md"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::Validation.to_string(), "validation_error");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
