//! Error types for the resilience core

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the client pool, bulk indexer and store facade
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// A new client could not be established (network, auth, bad endpoint)
    #[error("Failed to connect to store: {0}")]
    ConnectError(String),

    /// No client available and the pool does not block when exhausted
    #[error("Client pool is exhausted, no available clients")]
    PoolExhausted,

    /// Operation attempted after the pool was closed
    #[error("Client pool is closed")]
    PoolClosed,

    /// Bulk submission while the primary client is degraded
    #[error("Store is not reachable, bulk submission rejected")]
    NotReachable,

    /// Store answered with a non-2xx status other than 404
    #[error("Store request failed with status {status_code}")]
    RequestError { status_code: u16 },

    /// Store answered 404
    #[error("Not found")]
    NotFound,

    /// Batch-level transport failure during a bulk flush
    #[error("Bulk flush failed: {0}")]
    FlushError(String),

    /// Borrow wait or request exceeded its time bound
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Submission after the bulk indexer has been closed
    #[error("Bulk indexer is closed")]
    IndexerClosed,

    /// A pooled client failed its liveness check where a healthy one was required
    #[error("Client validation failed: {0}")]
    Validation(String),
}

impl ResilienceError {
    /// Check if this error is worth retrying later
    pub fn is_transient(&self) -> bool {
        match self {
            ResilienceError::ConnectError(_)
            | ResilienceError::PoolExhausted
            | ResilienceError::NotReachable
            | ResilienceError::FlushError(_)
            | ResilienceError::Timeout(_)
            | ResilienceError::Validation(_) => true,
            ResilienceError::RequestError { status_code } => {
                matches!(status_code, 429 | 502 | 503 | 504)
            }
            ResilienceError::PoolClosed
            | ResilienceError::NotFound
            | ResilienceError::IndexerClosed => false,
        }
    }

    /// True for the "no such document/index" signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResilienceError::NotFound)
    }

    /// HTTP status carried by this error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ResilienceError::RequestError { status_code } => Some(*status_code),
            ResilienceError::NotFound => Some(404),
            _ => None,
        }
    }

    /// Map a store response status into the error taxonomy.
    ///
    /// Returns `None` for 2xx.
    pub fn from_status(status_code: u16) -> Option<Self> {
        match status_code {
            200..=299 => None,
            404 => Some(ResilienceError::NotFound),
            status_code => Some(ResilienceError::RequestError { status_code }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connect = ResilienceError::ConnectError("refused".to_string());
        assert!(connect.is_transient());
        assert!(!connect.is_not_found());

        assert!(!ResilienceError::PoolClosed.is_transient());
        assert!(ResilienceError::NotFound.is_not_found());
        assert!(!ResilienceError::NotFound.is_transient());

        assert!(ResilienceError::RequestError { status_code: 503 }.is_transient());
        assert!(!ResilienceError::RequestError { status_code: 400 }.is_transient());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(ResilienceError::from_status(200), None);
        assert_eq!(ResilienceError::from_status(201), None);
        assert_eq!(
            ResilienceError::from_status(404),
            Some(ResilienceError::NotFound)
        );
        assert_eq!(
            ResilienceError::from_status(500),
            Some(ResilienceError::RequestError { status_code: 500 })
        );
        assert_eq!(ResilienceError::NotFound.status_code(), Some(404));
        assert_eq!(ResilienceError::PoolExhausted.status_code(), None);
    }
}
