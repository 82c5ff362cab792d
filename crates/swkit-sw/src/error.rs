//! Error taxonomy for the service worker core.

use swkit_net::NetError;
use thiserror::Error;
use url::Url;

use crate::types::{InstallState, WorkerId};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    /// Insecure scheme for the script or its scope. Nothing was written.
    #[error("Security policy violation: {0}")]
    PolicyViolation(String),

    #[error("Service worker {0} does not exist")]
    NotFound(WorkerId),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    /// An extendable event failed inside the worker runtime.
    #[error("Worker {id} failed to handle '{event}': {message}")]
    RuntimeDispatch {
        id: WorkerId,
        event: String,
        message: String,
    },

    #[error("Worker {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: WorkerId,
        from: InstallState,
        to: InstallState,
    },

    /// The worker was superseded or failed; it can no longer run.
    #[error("Service worker {0} is redundant")]
    Redundant(WorkerId),

    /// No usable worker covers the URL.
    #[error("No service worker controls {0}")]
    NoController(Url),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceWorkerError {
    pub fn policy(message: impl Into<String>) -> Self {
        Self::PolicyViolation(message.into())
    }

    pub fn dispatch(id: WorkerId, event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RuntimeDispatch {
            id,
            event: event.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Short name used as a log field.
    pub fn category(&self) -> &'static str {
        match self {
            ServiceWorkerError::PolicyViolation(_) => "policy",
            ServiceWorkerError::NotFound(_) => "not_found",
            ServiceWorkerError::Storage(_) => "storage",
            ServiceWorkerError::Network(_) => "network",
            ServiceWorkerError::RuntimeDispatch { .. } => "runtime_dispatch",
            ServiceWorkerError::InvalidTransition { .. } => "invalid_transition",
            ServiceWorkerError::Redundant(_) => "redundant",
            ServiceWorkerError::NoController(_) => "no_controller",
            ServiceWorkerError::Config(_) => "config",
            ServiceWorkerError::Internal(_) => "internal",
        }
    }
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(ServiceWorkerError::policy("http").category(), "policy");
        assert_eq!(
            ServiceWorkerError::NotFound(WorkerId::new(1)).category(),
            "not_found"
        );
        assert_eq!(
            ServiceWorkerError::dispatch(WorkerId::new(1), "install", "boom").category(),
            "runtime_dispatch"
        );
    }

    #[test]
    fn test_dispatch_message() {
        let err = ServiceWorkerError::dispatch(WorkerId::new(7), "activate", "threw");
        assert_eq!(err.to_string(), "Worker 7 failed to handle 'activate': threw");
    }
}
