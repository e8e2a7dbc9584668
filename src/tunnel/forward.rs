//! Persistent forwards of a remote Unix socket to a local path.
//!
//! A forward for a host is considered active while the parent directory of
//! its local socket exists. That check is only advisory: two provider
//! processes sharing a socket directory can both decide to start a forward.
//! Within one [`SocketForwarder`], concurrent first calls for the same host
//! are serialised so only one forwarding task is started.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::{TunnelError, TunnelSession};
use crate::error::ProviderError;
use crate::machines::ProviderFuture;
use crate::supervisor::TaskSupervisor;

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FORWARD_START_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL_SECS: u16 = 15;

/// Describes one remote-to-local socket forward.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForwardRequest {
    /// Mesh host name of the machine.
    pub hostname: String,
    /// Port of the machine's SSH server.
    pub ssh_port: u16,
    /// Socket path on the machine.
    pub remote_socket: String,
    /// Socket path on this host.
    pub local_socket: Utf8PathBuf,
}

/// Carries bytes between the local and remote sockets.
pub trait ForwardTransport: Send + Sync {
    /// Runs the forward until it fails.
    ///
    /// Implementations send on `ready` once the local socket accepts
    /// connections. The returned future completes only when the forward has
    /// stopped; a clean exit still means the forward is gone.
    fn run(
        &self,
        session: Arc<dyn TunnelSession>,
        request: ForwardRequest,
        ready: oneshot::Sender<()>,
    ) -> ProviderFuture<'_, (), TunnelError>;
}

/// Starts and tracks socket forwards, one per host.
pub struct SocketForwarder {
    transport: Arc<dyn ForwardTransport>,
    supervisor: Arc<TaskSupervisor>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for SocketForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketForwarder").finish_non_exhaustive()
    }
}

impl SocketForwarder {
    /// Creates a forwarder running its tasks under `supervisor`.
    #[must_use]
    pub fn new(transport: Arc<dyn ForwardTransport>, supervisor: Arc<TaskSupervisor>) -> Self {
        Self {
            transport,
            supervisor,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, hostname: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(hostname.to_owned()).or_default())
    }

    /// Ensures a forward for `request.hostname` is running.
    ///
    /// Returns immediately when the local socket's parent directory exists.
    /// Otherwise creates it, starts a background forwarding task, and waits
    /// until the task reports the local socket ready. When the task stops,
    /// it removes the local socket and its directory so the next call starts
    /// a fresh forward.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Io`] when the directory cannot be created and
    /// the transport's error when the forward fails before becoming ready.
    pub async fn ensure_forward(
        &self,
        session: Arc<dyn TunnelSession>,
        request: ForwardRequest,
    ) -> Result<(), TunnelError> {
        let gate = self.gate(&request.hostname);
        let _held = gate.lock().await;

        let parent = socket_parent(&request.local_socket)?;
        if tokio::fs::try_exists(parent).await? {
            debug!(
                hostname = %request.hostname,
                path = %request.local_socket,
                "forward already active"
            );
            return Ok(());
        }
        tokio::fs::create_dir_all(parent).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let transport = Arc::clone(&self.transport);
        let task_request = request.clone();
        self.supervisor
            .spawn(format!("forward:{}", request.hostname), async move {
                let hostname = task_request.hostname.clone();
                let local_socket = task_request.local_socket.clone();
                let failure = match transport.run(session, task_request, ready_tx).await {
                    Ok(()) => TunnelError::Forward {
                        hostname,
                        message: String::from("forward exited"),
                    },
                    Err(err) => err,
                };
                remove_forward_paths(&local_socket).await;
                if done_tx.send(failure.clone()).is_err() {
                    debug!(path = %local_socket, "no caller waiting on forward result");
                }
                Err(ProviderError::Tunnel(failure))
            });

        if ready_rx.await.is_ok() {
            info!(
                hostname = %request.hostname,
                path = %request.local_socket,
                "socket forward ready"
            );
            return Ok(());
        }
        Err(done_rx.await.unwrap_or_else(|_| TunnelError::Forward {
            hostname: request.hostname,
            message: String::from("forward task ended without reporting a result"),
        }))
    }
}

fn socket_parent(path: &Utf8Path) -> Result<&Utf8Path, TunnelError> {
    path.parent()
        .filter(|parent| !parent.as_str().is_empty())
        .ok_or_else(|| TunnelError::Io {
            message: format!("socket path {path} has no parent directory"),
        })
}

async fn remove_forward_paths(local_socket: &Utf8Path) {
    if let Err(err) = tokio::fs::remove_file(local_socket).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %local_socket, error = %err, "failed to remove forwarded socket");
        }
    }
    if let Some(parent) = local_socket.parent() {
        if let Err(err) = tokio::fs::remove_dir_all(parent).await {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %parent, error = %err, "failed to remove forward directory");
            }
        }
    }
}

/// Forwards sockets with an `ssh -L` child process reaching the machine
/// through the session's proxy command.
#[derive(Clone, Debug)]
pub struct SshForwardTransport {
    ssh_bin: String,
    ssh_user: String,
    start_timeout: Duration,
}

impl SshForwardTransport {
    /// Creates a transport running `ssh_bin` as `ssh_user`.
    #[must_use]
    pub fn new(ssh_bin: impl Into<String>, ssh_user: impl Into<String>) -> Self {
        Self {
            ssh_bin: ssh_bin.into(),
            ssh_user: ssh_user.into(),
            start_timeout: FORWARD_START_TIMEOUT,
        }
    }

    /// Overrides how long to wait for the local socket to appear.
    #[must_use]
    pub const fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Builds the `ssh` argument list for `request`.
    #[must_use]
    pub fn ssh_args(&self, proxy_command: &str, request: &ForwardRequest) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-N"),
            OsString::from("-T"),
            OsString::from("-p"),
            OsString::from(request.ssh_port.to_string()),
        ];
        for option in [
            String::from("BatchMode=yes"),
            String::from("StrictHostKeyChecking=no"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("ExitOnForwardFailure=yes"),
            String::from("StreamLocalBindUnlink=yes"),
            format!("ServerAliveInterval={KEEPALIVE_INTERVAL_SECS}"),
            format!("ProxyCommand={proxy_command}"),
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from("-L"));
        args.push(OsString::from(format!(
            "{}:{}",
            request.local_socket, request.remote_socket
        )));
        args.push(OsString::from(format!(
            "{}@{}",
            self.ssh_user, request.hostname
        )));
        args
    }

    async fn wait_for_socket(
        &self,
        child: &mut tokio::process::Child,
        request: &ForwardRequest,
    ) -> Result<(), TunnelError> {
        let deadline = Instant::now() + self.start_timeout;
        loop {
            if tokio::fs::try_exists(&request.local_socket).await? {
                return Ok(());
            }
            if let Some(status) = child.try_wait()? {
                let stderr = read_stderr(child).await;
                return Err(TunnelError::Forward {
                    hostname: request.hostname.clone(),
                    message: format!("ssh exited with {status}: {stderr}"),
                });
            }
            if Instant::now() >= deadline {
                child.kill().await?;
                return Err(TunnelError::Forward {
                    hostname: request.hostname.clone(),
                    message: format!(
                        "local socket {} did not appear within {:?}",
                        request.local_socket, self.start_timeout
                    ),
                });
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
    }
}

async fn read_stderr(child: &mut tokio::process::Child) -> String {
    let mut buffer = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        if let Err(err) = stderr.read_to_string(&mut buffer).await {
            debug!(error = %err, "failed to read ssh stderr");
        }
    }
    buffer.trim().to_owned()
}

impl ForwardTransport for SshForwardTransport {
    fn run(
        &self,
        session: Arc<dyn TunnelSession>,
        request: ForwardRequest,
        ready: oneshot::Sender<()>,
    ) -> ProviderFuture<'_, (), TunnelError> {
        Box::pin(async move {
            let args = self.ssh_args(&session.proxy_command(), &request);
            let mut child = Command::new(&self.ssh_bin)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| TunnelError::Spawn {
                    program: self.ssh_bin.clone(),
                    message: err.to_string(),
                })?;

            self.wait_for_socket(&mut child, &request).await?;
            if ready.send(()).is_err() {
                debug!(hostname = %request.hostname, "no caller waiting for forward readiness");
            }

            let status = child.wait().await?;
            let stderr = read_stderr(&mut child).await;
            Err(TunnelError::Forward {
                hostname: request.hostname,
                message: format!("ssh exited with {status}: {stderr}"),
            })
        })
    }
}
