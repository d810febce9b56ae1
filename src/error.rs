//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A resolved rate rule is not usable (zero limit or window)
    #[error("Invalid rate rule: {0}")]
    InvalidRule(String),

    /// The backing store could not be reached or timed out
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backing store replied with something we cannot interpret
    #[error("Backend protocol error: {0}")]
    BackendProtocol(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

impl From<redis::RedisError> for TurnstileError {
    fn from(err: redis::RedisError) -> Self {
        // Only transport failures count as unavailable. Anything the server
        // actually answered (script errors, WRONGTYPE, bad types) is protocol.
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            TurnstileError::BackendUnavailable(err.to_string())
        } else {
            TurnstileError::BackendProtocol(err.to_string())
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
