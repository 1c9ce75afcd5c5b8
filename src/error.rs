//! Error types for Pacer.

use thiserror::Error;

/// Main error type for Pacer operations.
#[derive(Error, Debug)]
pub enum PacerError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while layering configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Lookup of a limiter name that is not registered
    #[error("Unknown limiter: {0}")]
    UnknownLimiter(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Pacer operations.
pub type Result<T> = std::result::Result<T, PacerError>;

/// Why a single `execute` call did not produce a value.
///
/// Each variant is scoped to one submitted operation; none of them affect
/// other operations queued on the same limiter.
#[derive(Error, Debug)]
pub enum ExecuteError<E> {
    /// Every attempt failed; carries the error from the last attempt.
    #[error("operation failed: {0}")]
    Operation(E),

    /// Rejected on submission because the queue was at its configured depth.
    #[error("queue is full ({depth} pending operations)")]
    QueueFull { depth: usize },

    /// `execute` was called outside a tokio runtime.
    #[error("no tokio runtime available to drive the queue")]
    NoRuntime,

    /// The operation panicked. Panics are not retried.
    #[error("operation panicked")]
    Panicked,

    /// The completion channel closed before a result was delivered.
    #[error("operation was abandoned before completing")]
    Abandoned,
}

impl<E> ExecuteError<E> {
    /// The operation's own error, if that is why the call failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            ExecuteError::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if the operation ran and failed on every attempt.
    pub fn is_operation(&self) -> bool {
        matches!(self, ExecuteError::Operation(_))
    }
}
