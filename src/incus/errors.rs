//! Incus API error types

use thiserror::Error;

/// Errors that can occur when communicating with the Incus daemon
#[derive(Debug, Error)]
pub enum IncusError {
    /// Transport-level failure on the Unix socket
    #[error("Request failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    /// Failure while reading a response body
    #[error("Failed to read response: {0}")]
    Body(#[from] hyper::Error),

    /// Failed to parse a JSON response
    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// The API returned an error envelope or a non-success HTTP status
    #[error("Incus error ({status}): {message}")]
    Api { status: u32, message: String },

    /// A background operation reported failure
    #[error("Operation failed: {0}")]
    Operation(String),

    /// A background operation was cancelled on the backend
    #[error("Operation cancelled")]
    Cancelled,

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A bounded wait exceeded its ceiling
    #[error("Request timed out")]
    Timeout,

    /// All retry attempts exhausted
    #[error("All retry attempts exhausted: {0}")]
    RetryExhausted(String),

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl IncusError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            IncusError::Transport(e) => e.is_connect(),
            // Closed connections surface as body read errors mid-response
            IncusError::Body(_) => true,
            _ => false,
        }
    }

    /// True when the backend socket could not be reached at all
    pub fn is_unavailable(&self) -> bool {
        match self {
            IncusError::Transport(e) => e.is_connect(),
            IncusError::RetryExhausted(_) => true,
            _ => false,
        }
    }

    /// Get the backend status code if available
    pub fn status_code(&self) -> Option<u32> {
        match self {
            IncusError::Api { status, .. } => Some(*status),
            IncusError::NotFound(_) => Some(404),
            _ => None,
        }
    }
}

/// Result type for Incus API operations
pub type IncusResult<T> = Result<T, IncusError>;
