//! Mesh-network session management and remote daemon reachability.
//!
//! A [`TunnelManager`] owns at most one [`TunnelSession`] for the lifetime of
//! the provider. The session is built lazily on first use by a
//! [`SessionFactory`]; concurrent first callers share a single construction.
//!
//! On top of the session, a [`DaemonConnector`] yields byte streams to the
//! remote container daemon. Two strategies exist:
//!
//! - [`ForwardedSocketConnector`] keeps one persistent SSH forward per host,
//!   exposing the remote Unix socket at a local path.
//! - [`DirectDialConnector`] dials the daemon's TCP port through the session
//!   for every connection.

mod connector;
mod dial;
mod error;
mod forward;
mod tailscale;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OnceCell;
use tracing::info;

use crate::machines::ProviderFuture;

pub use connector::{DaemonConnector, DirectDialConnector, ForwardedSocketConnector};
pub use dial::DIAL_RETRY_INTERVAL;
pub use error::TunnelError;
pub use forward::{ForwardRequest, ForwardTransport, SocketForwarder, SshForwardTransport};
pub use tailscale::TailscaleSessionFactory;

/// Bidirectional byte stream carried over the mesh network.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed stream returned by dials and daemon connectors.
pub type TunnelStream = Box<dyn TunnelIo>;

/// An authenticated mesh-network session.
pub trait TunnelSession: Send + Sync {
    /// Host name this session registered on the mesh network.
    fn hostname(&self) -> &str;

    /// Opens a TCP connection to `host:port` through the mesh.
    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> ProviderFuture<'a, TunnelStream, TunnelError>;

    /// Shell command usable as an SSH `ProxyCommand`, with `%h` and `%p`
    /// placeholders for the target host and port.
    fn proxy_command(&self) -> String;
}

/// Builds new mesh sessions.
pub trait SessionFactory: Send + Sync {
    /// Constructs and authenticates a new session.
    fn connect(&self) -> ProviderFuture<'_, Arc<dyn TunnelSession>, TunnelError>;
}

/// Owns the provider's single lazily-initialised mesh session.
pub struct TunnelManager {
    factory: Box<dyn SessionFactory>,
    session: OnceCell<Arc<dyn TunnelSession>>,
    dial_retry_interval: std::time::Duration,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("connected", &self.session.initialized())
            .field("dial_retry_interval", &self.dial_retry_interval)
            .finish_non_exhaustive()
    }
}

impl TunnelManager {
    /// Creates a manager that builds its session with `factory`.
    #[must_use]
    pub fn new(factory: impl SessionFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            session: OnceCell::new(),
            dial_retry_interval: DIAL_RETRY_INTERVAL,
        }
    }

    /// Overrides the retry interval used by
    /// [`TunnelManager::wait_for_dial`]. Intended for tests.
    #[must_use]
    pub const fn with_dial_retry_interval(mut self, interval: std::time::Duration) -> Self {
        self.dial_retry_interval = interval;
        self
    }

    /// Returns the session, constructing it on first call.
    ///
    /// Concurrent callers racing the first construction wait for the same
    /// attempt. A failed construction leaves the manager empty so a later
    /// call can try again.
    ///
    /// # Errors
    ///
    /// Returns the [`TunnelError`] raised by the session factory.
    pub async fn session(&self) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        let session = self
            .session
            .get_or_try_init(|| async {
                let created = self.factory.connect().await?;
                info!(hostname = created.hostname(), "mesh session established");
                Ok::<_, TunnelError>(created)
            })
            .await?;
        Ok(Arc::clone(session))
    }

    /// Returns `true` once a session has been established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.initialized()
    }
}

#[cfg(test)]
mod tests;
