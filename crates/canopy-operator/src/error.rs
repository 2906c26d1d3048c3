//! Error types for the Canopy controllers

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during reconciliation
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Store operation failed
    #[error("Store error: {0}")]
    Store(#[from] canopy_core::Error),

    /// Namespace, secret or role binding propagation failed
    #[error(transparent)]
    Propagation(#[from] crate::propagation::PropagationError),

    /// Invalid controller configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::Store(e) => e.is_retryable(),
            OperatorError::Propagation(e) => e.source.is_retryable(),
            _ => false,
        }
    }

    /// Suggested requeue delay; `None` leaves the choice to the backoff policy
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::Store(e) => e.requeue_delay(),
            OperatorError::Propagation(e) => e.source.requeue_delay(),
            _ => None,
        }
    }
}
