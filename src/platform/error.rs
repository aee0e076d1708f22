//! Errors for calls into the coordination point

use std::fmt;

use crate::metrics::MetricsError;

/// Result type alias for platform calls
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Errors that can occur while talking to the coordination point
#[derive(Debug)]
pub enum PlatformError {
    /// Connection could not be established or broke mid-call
    Transport(String),

    /// The platform answered with a non-success status
    Status { status: u16, message: String },

    /// A response or stream frame could not be decoded
    Decode(String),

    /// The platform rejected a query as invalid
    InvalidQuery(MetricsError),

    /// The stream or single-shot subscription was closed before a value arrived
    Closed,
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Transport(msg) => write!(f, "platform unreachable: {msg}"),
            PlatformError::Status { status, message } => {
                write!(f, "platform returned {status}: {message}")
            }
            PlatformError::Decode(msg) => write!(f, "failed to decode platform response: {msg}"),
            PlatformError::InvalidQuery(err) => write!(f, "invalid query: {err}"),
            PlatformError::Closed => write!(f, "platform closed the subscription"),
        }
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlatformError::InvalidQuery(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MetricsError> for PlatformError {
    fn from(err: MetricsError) -> Self {
        PlatformError::InvalidQuery(err)
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        PlatformError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PlatformError::Decode(err.to_string())
        } else {
            PlatformError::Transport(err.to_string())
        }
    }
}

#[cfg(feature = "remote")]
impl From<tokio_tungstenite::tungstenite::Error> for PlatformError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PlatformError::Transport(err.to_string())
    }
}
