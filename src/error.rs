/*!
 * Error types for Storm
 */

use storm_core_resilience::ResilienceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StormError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_UNAVAILABLE: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum StormError {
    /// Store access failed (pool, transport, status)
    #[error(transparent)]
    Store(#[from] ResilienceError),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file is not valid TOML for [`crate::config::AppConfig`]
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl StormError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        if self.is_transient() {
            // worth restarting once the store or network is back
            EXIT_UNAVAILABLE
        } else {
            EXIT_FATAL
        }
    }

    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        match self {
            StormError::Store(e) => e.is_transient(),
            StormError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            StormError::Http(e) => e.is_timeout() || e.is_connect(),
            StormError::Config(_) | StormError::ConfigParse(_) => false,
        }
    }

    /// True for the store's "no such document/index" signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, StormError::Store(e) if e.is_not_found())
    }
}
