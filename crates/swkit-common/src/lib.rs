//! # swkit common
//!
//! Shared plumbing for the swkit crates.
//!
//! ## Features
//!
//! - Logging configuration and subscriber setup
//! - Bounding async work with a timeout

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub mod logging;

pub use logging::{init_logging, init_test_logging, LogConfig, LogFormat};

/// Errors produced by the shared helpers.
#[derive(Error, Debug)]
pub enum CommonError {
    /// A global tracing subscriber was already installed.
    #[error("Logging already initialized: {0}")]
    LoggingInit(String),

    /// The supplied filter directive could not be parsed.
    #[error("Invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    /// The operation did not finish in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Run an operation with a timeout.
///
/// The future is dropped when the deadline passes; any I/O it already started
/// is not rolled back.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, CommonError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| CommonError::Timeout(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), || async {
            sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(CommonError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_timeout_completes() {
        let result = with_timeout(Duration::from_secs(1), || async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
