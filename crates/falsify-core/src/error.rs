use core::result::Result as CoreResult;
use std::io::Error as IoError;

use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use toml::de::Error as TomlError;

/// Result type for falsification operations.
pub type Result<T> = CoreResult<T, Error>;

/// Errors raised by the snapshot pool, the execution engine, and their collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// No snapshot is available and the pool has reached capacity.
    #[error("Snapshot pool exhausted: {leased} leased, capacity {capacity}")]
    PoolExhausted {
        /// Configured pool capacity.
        capacity: usize,
        /// Number of leases held when the request was refused.
        leased: usize,
    },

    /// Creating or resetting a pooled snapshot failed.
    #[error("Pool operation failed: {0}")]
    PoolOperation(String),

    /// A test command exceeded its allotted time.
    #[error("Execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    /// A test command could not be spawned or its artifact was missing.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The persisted pool state could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A version-control command failed.
    #[error("{operation} failed: {message}")]
    Vcs {
        /// The adapter operation that failed.
        operation: &'static str,
        /// Captured stderr or spawn error.
        message: String,
    },

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A hypothesis failed validation before it reached the pool.
    #[error("Invalid hypothesis: {0}")]
    InvalidHypothesis(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] SerdeJsonError),

    /// TOML deserialization failed.
    #[error("TOML deserialization error: {0}")]
    Toml(#[from] TomlError),

    /// A general error not covered by other variants.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure is contained to one attempt and the batch can go on.
    ///
    /// Pool exhaustion is recovered through fallback or backoff; timeouts and
    /// execution errors are classified into the hypothesis result; persistence
    /// errors degrade to an empty pool state.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::ExecutionTimeout(_)
                | Self::Execution(_)
                | Self::Persistence(_)
        )
    }

    /// Whether this is the capacity-reached condition.
    #[must_use]
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let exhausted = Error::PoolExhausted {
            capacity: 2,
            leased: 2,
        };
        assert_eq!(
            exhausted.to_string(),
            "Snapshot pool exhausted: 2 leased, capacity 2"
        );

        let vcs = Error::Vcs {
            operation: "git worktree add",
            message: "fatal: not a git repository".to_owned(),
        };
        assert_eq!(
            vcs.to_string(),
            "git worktree add failed: fatal: not a git repository"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(
            Error::PoolExhausted {
                capacity: 1,
                leased: 1
            }
            .is_recoverable()
        );
        assert!(Error::ExecutionTimeout(1000).is_recoverable());
        assert!(Error::Persistence("unreadable".to_owned()).is_recoverable());
        assert!(!Error::PoolOperation("reset failed".to_owned()).is_recoverable());
        assert!(!Error::Config("bad".to_owned()).is_recoverable());
    }

    #[test]
    fn test_pool_exhausted_is_distinct_from_operation_error() {
        let exhausted = Error::PoolExhausted {
            capacity: 1,
            leased: 1,
        };
        assert!(exhausted.is_pool_exhausted());
        assert!(!Error::PoolOperation("create".to_owned()).is_pool_exhausted());
    }

    #[test]
    fn test_io_conversion() {
        let error: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(error, Error::Io(_)));
    }
}
