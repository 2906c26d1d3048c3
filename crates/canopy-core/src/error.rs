//! Error types shared by the Canopy controllers and repositories

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to the declarative store or
/// converging workload state
#[derive(Error, Debug)]
pub enum Error {
    /// Referenced or watched object is absent
    #[error("{kind} not found: {name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Object already exists
    #[error("{kind} already exists: {name} in namespace {namespace}")]
    AlreadyExists {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Optimistic-concurrency rejection
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller's identity is not allowed to perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Deadline elapsed before the awaited condition arrived
    #[error("{target} did not get the {condition} condition with status {status} before the deadline")]
    Timeout {
        target: String,
        condition: String,
        status: String,
    },

    /// Semantic precondition violated
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Store rejected the object as invalid
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Network or server-side failure that may succeed on retry
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Some propagated objects could not be removed
    #[error("Cleanup incomplete in namespace {namespace}, failed to delete: {}", names.join(", "))]
    CleanupIncomplete {
        namespace: String,
        names: Vec<String>,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for store and reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    pub fn already_exists(kind: &str, namespace: &str, name: &str) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Transient(_))
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            Error::Conflict(_) => Some(Duration::from_secs(1)),
            Error::Transient(_) => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => Error::NotFound {
                    kind: message_kind(&ae),
                    name: message_name(&ae),
                    namespace: String::new(),
                },
                409 if ae.reason == "AlreadyExists" => Error::AlreadyExists {
                    kind: message_kind(&ae),
                    name: message_name(&ae),
                    namespace: String::new(),
                },
                409 => Error::Conflict(ae.message),
                401 | 403 => Error::Forbidden(ae.message),
                400 | 422 => Error::Invalid(ae.message),
                _ => Error::Transient(ae.message),
            },
            kube::Error::SerdeError(e) => Error::Serialization(e),
            other => Error::Transient(other.to_string()),
        }
    }
}

/// Resource kind from a Kubernetes status message such as `secrets "foo" not found`
fn message_kind(ae: &kube::error::ErrorResponse) -> String {
    ae.message
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Quoted object name from a Kubernetes status message
fn message_name(ae: &kube::error::ErrorResponse) -> String {
    ae.message.split('"').nth(1).unwrap_or_default().to_string()
}
