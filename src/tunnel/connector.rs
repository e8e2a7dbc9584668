//! Strategies for reaching the remote container daemon.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::net::UnixStream;

use super::{ForwardRequest, SocketForwarder, TunnelError, TunnelManager, TunnelStream};
use crate::machines::ProviderFuture;

const FORWARD_SOCKET_NAME: &str = "daemon-forward.sock";

/// Obtains a connection to the container daemon on a machine.
pub trait DaemonConnector: Send + Sync {
    /// Opens a fresh byte stream to the daemon on `hostname`.
    fn connect<'a>(&'a self, hostname: &'a str) -> ProviderFuture<'a, TunnelStream, TunnelError>;
}

/// Connects through a persistent per-host SSH socket forward.
#[derive(Debug)]
pub struct ForwardedSocketConnector {
    tunnel: Arc<TunnelManager>,
    forwarder: SocketForwarder,
    local_sock_dir: Utf8PathBuf,
    remote_socket: String,
    ssh_port: u16,
}

impl ForwardedSocketConnector {
    /// Creates a connector that places forwarded sockets under
    /// `local_sock_dir`.
    #[must_use]
    pub fn new(
        tunnel: Arc<TunnelManager>,
        forwarder: SocketForwarder,
        local_sock_dir: &Utf8Path,
        remote_socket: impl Into<String>,
        ssh_port: u16,
    ) -> Self {
        Self {
            tunnel,
            forwarder,
            local_sock_dir: local_sock_dir.to_owned(),
            remote_socket: remote_socket.into(),
            ssh_port,
        }
    }

    /// Deterministic local socket path for `hostname`.
    #[must_use]
    pub fn socket_path(&self, hostname: &str) -> Utf8PathBuf {
        self.local_sock_dir.join(hostname).join(FORWARD_SOCKET_NAME)
    }

    /// Ensures the forward for `hostname` is running and returns the local
    /// socket path. Clients that speak the daemon API over a Unix socket
    /// should be pointed at this path.
    ///
    /// # Errors
    ///
    /// Returns a [`TunnelError`] when the session or the forward cannot be
    /// established.
    pub async fn ensure_socket(&self, hostname: &str) -> Result<Utf8PathBuf, TunnelError> {
        let session = self.tunnel.session().await?;
        let local_socket = self.socket_path(hostname);
        self.forwarder
            .ensure_forward(
                session,
                ForwardRequest {
                    hostname: hostname.to_owned(),
                    ssh_port: self.ssh_port,
                    remote_socket: self.remote_socket.clone(),
                    local_socket: local_socket.clone(),
                },
            )
            .await?;
        Ok(local_socket)
    }
}

impl DaemonConnector for ForwardedSocketConnector {
    fn connect<'a>(&'a self, hostname: &'a str) -> ProviderFuture<'a, TunnelStream, TunnelError> {
        Box::pin(async move {
            let path = self.ensure_socket(hostname).await?;
            let stream = UnixStream::connect(&path).await?;
            Ok(Box::new(stream) as TunnelStream)
        })
    }
}

/// Dials the daemon's TCP port through the session for each connection.
#[derive(Debug)]
pub struct DirectDialConnector {
    tunnel: Arc<TunnelManager>,
    daemon_port: u16,
}

impl DirectDialConnector {
    /// Creates a connector dialling `daemon_port` on each machine.
    #[must_use]
    pub const fn new(tunnel: Arc<TunnelManager>, daemon_port: u16) -> Self {
        Self {
            tunnel,
            daemon_port,
        }
    }
}

impl DaemonConnector for DirectDialConnector {
    fn connect<'a>(&'a self, hostname: &'a str) -> ProviderFuture<'a, TunnelStream, TunnelError> {
        Box::pin(async move {
            let session = self.tunnel.session().await?;
            session.dial(hostname, self.daemon_port).await
        })
    }
}
