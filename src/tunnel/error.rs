//! Error type for the mesh session and socket forwarding.

use thiserror::Error;

/// Errors raised while constructing the mesh session, dialling through it,
/// or maintaining a forwarded socket.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TunnelError {
    /// Raised when a helper process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Error reported by the operating system.
        message: String,
    },
    /// Raised when the session cannot authenticate against the control server.
    #[error("mesh session login failed: {message}")]
    Login {
        /// Diagnostic output from the login attempt.
        message: String,
    },
    /// Raised when a dial through the session fails.
    #[error("failed to dial {host}:{port}: {message}")]
    Dial {
        /// Remote host name on the mesh network.
        host: String,
        /// Remote TCP port.
        port: u16,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a socket forward fails to start or terminates.
    #[error("socket forward to {hostname} failed: {message}")]
    Forward {
        /// Remote host the forward targets.
        hostname: String,
        /// Diagnostic output from the forwarding transport.
        message: String,
    },
    /// Raised for local filesystem or socket errors.
    #[error("tunnel I/O error: {message}")]
    Io {
        /// I/O error message.
        message: String,
    },
}

impl From<std::io::Error> for TunnelError {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            message: value.to_string(),
        }
    }
}
