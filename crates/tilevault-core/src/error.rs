//! Error types and result aliases for tilevault.
//!
//! Every failure in the atomic-write subsystem surfaces as one of these
//! variants. Only diagnostics reporting is allowed to swallow an error; all
//! other failures propagate to the caller unchanged.

use std::fmt;

/// The result type used throughout tilevault.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tilevault operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A lease is held by someone else and could not be acquired.
    ///
    /// Returned immediately by `acquire` and, after the retry budget is
    /// spent, by `acquire_with_retry`.
    #[error("lock contention on '{lock_id}': held by {holder} ({attempts} attempt(s))")]
    LockContention {
        /// The contended lock identifier.
        lock_id: String,
        /// Owner of the conflicting lease.
        holder: String,
        /// Number of acquisition attempts made.
        attempts: u32,
    },

    /// A renew or release was attempted by an owner that does not hold the lease.
    #[error("lock ownership violation on '{lock_id}': '{caller}' is not the lease owner")]
    LockOwnership {
        /// The lock identifier.
        lock_id: String,
        /// Owner identity presented by the caller.
        caller: String,
    },

    /// The caller's lease no longer exists.
    #[error("lease not held: {lock_id} (owner {owner})")]
    LeaseNotHeld {
        /// The lock identifier.
        lock_id: String,
        /// Owner identity presented by the caller.
        owner: String,
    },

    /// A caller-supplied write hook failed.
    #[error("atomic write step '{step}' failed: {source}")]
    HookFailed {
        /// Name of the step whose hook failed.
        step: &'static str,
        /// The hook's error.
        #[source]
        source: Box<Error>,
    },

    /// The manifest row did not reach the state the write sequence requires.
    #[error("manifest invariant violated: {message}")]
    ManifestInvariant {
        /// Description of the violation.
        message: String,
    },

    /// The subsystem was wired with an inconsistent configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A database abstraction call failed.
    #[error("database error: {message}")]
    Database {
        /// Description of the database failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A filesystem operation failed.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: String,
        /// The underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new database error with the given message.
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new database error with a source cause.
    #[must_use]
    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new io error for the given path.
    #[must_use]
    pub fn io(path: impl fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new manifest invariant error.
    #[must_use]
    pub fn manifest_invariant(message: impl Into<String>) -> Self {
        Self::ManifestInvariant {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wraps a hook error with the step it failed in.
    #[must_use]
    pub fn hook_failed(step: &'static str, source: Self) -> Self {
        Self::HookFailed {
            step,
            source: Box::new(source),
        }
    }

    /// Returns true if this is a lock contention error.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::database_with_source("sqlite", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_failure_keeps_step_and_source() {
        let err = Error::hook_failed("atomic_rename", Error::internal("disk full"));
        assert_eq!(
            err.to_string(),
            "atomic write step 'atomic_rename' failed: internal error: disk full"
        );
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "internal error: disk full");
    }

    #[test]
    fn contention_is_detectable() {
        let err = Error::LockContention {
            lock_id: "map:p1:m1".into(),
            holder: "svc-a".into(),
            attempts: 5,
        };
        assert!(err.is_contention());
        assert!(!Error::internal("x").is_contention());
    }
}
