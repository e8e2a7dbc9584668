//! Error taxonomy shared by every provider operation.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::tunnel::TunnelError;

/// Errors surfaced by lifecycle operations, the readiness poller, the tunnel
/// layer and the log streamer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when credentials or organisation settings are missing or
    /// invalid. Always returned before any network call is attempted.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Raised when the control-plane API answers with a non-success status.
    #[error("remote API returned status {status}: {body}")]
    RemoteApi {
        /// HTTP status code returned by the API.
        status: u16,
        /// Response body, kept verbatim for diagnostics.
        body: String,
    },
    /// Raised when a machine lookup by name finds no match.
    #[error("machine {name} not found")]
    NotFound {
        /// Derived machine name that was looked up.
        name: String,
    },
    /// Raised when a bounded wait exceeds its deadline.
    #[error("timed out waiting for {action} after {elapsed:?}")]
    Timeout {
        /// Operation being waited on.
        action: String,
        /// Wall-clock time spent before giving up.
        elapsed: Duration,
    },
    /// Raised when the mesh session or a socket forward fails.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    /// Raised when an HTTP request cannot be sent or its body read.
    #[error("transport error: {message}")]
    Transport {
        /// Message reported by the HTTP client.
        message: String,
    },
    /// Raised when a response body does not match the expected shape.
    #[error("failed to decode {what}: {message}")]
    Decode {
        /// Payload being decoded.
        what: String,
        /// Decoder message.
        message: String,
    },
    /// Raised when the log sink rejects a write.
    #[error("log sink error: {message}")]
    Sink {
        /// I/O error message.
        message: String,
    },
}

impl From<ConfigError> for ProviderError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}

impl ProviderError {
    /// Builds a [`ProviderError::Timeout`] for `action`.
    #[must_use]
    pub fn timeout(action: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            action: action.into(),
            elapsed,
        }
    }

    /// Returns `true` for [`ProviderError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
