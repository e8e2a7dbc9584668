//! Mesh session hosted by a userspace `tailscaled` owned by this process.

use std::borrow::Cow;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SessionFactory, TunnelError, TunnelSession, TunnelStream};
use crate::config::ProviderConfig;
use crate::machines::ProviderFuture;

const SESSION_DIR: &str = "tsnet";
const HOSTNAME_PREFIX: &str = "fly-provider-";
const CONTROL_SOCKET: &str = "tailscaled.sock";
const DAEMON_LOG: &str = "tailscaled.log";
const LOGIN_TIMEOUT: Duration = Duration::from_secs(60);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SPAWN_ATTEMPTS: usize = 3;

/// Builds sessions by launching `tailscaled` in userspace-networking mode
/// with a SOCKS5 listener, then logging it in with a pre-shared key.
///
/// Every session gets a fresh state directory under
/// `<base_path>/tsnet/<uuid>` and the host name `fly-provider-<uuid>`, so
/// several provider processes can share one base path. The directory is
/// removed again when the session cannot be established.
///
/// The SOCKS5 port is picked by binding an ephemeral loopback port and
/// releasing it for `tailscaled`. If another process takes the port first,
/// `tailscaled` exits and the launch is retried on a fresh port.
#[derive(Clone)]
pub struct TailscaleSessionFactory {
    base_path: Utf8PathBuf,
    network_key: String,
    control_url: String,
    tailscaled_bin: String,
    tailscale_bin: String,
    login_timeout: Duration,
}

impl std::fmt::Debug for TailscaleSessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailscaleSessionFactory")
            .field("base_path", &self.base_path)
            .field("control_url", &self.control_url)
            .field("network_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl TailscaleSessionFactory {
    /// Creates a factory from the provider configuration.
    #[must_use]
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            base_path: config.base_path(),
            network_key: config.network_key.clone(),
            control_url: config.control_url.clone(),
            tailscaled_bin: config.tailscaled_bin.clone(),
            tailscale_bin: config.tailscale_bin.clone(),
            login_timeout: LOGIN_TIMEOUT,
        }
    }

    fn spawn_daemon(
        &self,
        state_dir: &Utf8Path,
        socks_addr: SocketAddr,
    ) -> Result<Child, TunnelError> {
        let log = std::fs::File::create(state_dir.join(DAEMON_LOG))?;
        Command::new(&self.tailscaled_bin)
            .arg("--tun=userspace-networking")
            .arg(format!("--statedir={state_dir}"))
            .arg(format!("--socket={}", state_dir.join(CONTROL_SOCKET)))
            .arg(format!("--socks5-server={socks_addr}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TunnelError::Spawn {
                program: self.tailscaled_bin.clone(),
                message: err.to_string(),
            })
    }

    /// Waits until the control socket exists and the SOCKS5 listener accepts
    /// connections, failing early if the daemon exits.
    async fn wait_for_daemon(
        &self,
        daemon: &mut Child,
        control_socket: &Utf8Path,
        socks_addr: SocketAddr,
    ) -> Result<(), DaemonStart> {
        let deadline = Instant::now() + self.login_timeout;
        loop {
            if tokio::fs::try_exists(control_socket)
                .await
                .map_err(|err| DaemonStart::Failed(err.into()))?
                && TcpStream::connect(socks_addr).await.is_ok()
            {
                return Ok(());
            }
            if let Some(status) = daemon
                .try_wait()
                .map_err(|err| DaemonStart::Failed(err.into()))?
            {
                return Err(DaemonStart::Exited(TunnelError::Login {
                    message: format!("{} exited with {status}", self.tailscaled_bin),
                }));
            }
            if Instant::now() >= deadline {
                return Err(DaemonStart::Failed(TunnelError::Login {
                    message: format!("tailscaled at {control_socket} did not become ready"),
                }));
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// Launches `tailscaled` on a fresh SOCKS5 port, retrying when the daemon
    /// exits before it is ready.
    async fn launch_daemon(
        &self,
        state_dir: &Utf8Path,
        control_socket: &Utf8Path,
    ) -> Result<(Child, SocketAddr), TunnelError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let socks_addr = reserve_loopback_port().await?;
            debug!(dir = %state_dir, %socks_addr, attempt, "starting tailscaled");
            let mut daemon = self.spawn_daemon(state_dir, socks_addr)?;
            match self
                .wait_for_daemon(&mut daemon, control_socket, socks_addr)
                .await
            {
                Ok(()) => return Ok((daemon, socks_addr)),
                Err(DaemonStart::Exited(err)) if attempt < SPAWN_ATTEMPTS => {
                    debug!(attempt, error = %err, "tailscaled exited early; retrying");
                }
                Err(DaemonStart::Exited(err) | DaemonStart::Failed(err)) => return Err(err),
            }
        }
    }

    async fn start_session(
        &self,
        id: Uuid,
        state_dir: &Utf8Path,
    ) -> Result<TailscaleSession, TunnelError> {
        Dir::create_ambient_dir_all(state_dir, ambient_authority())?;
        let hostname = format!("{HOSTNAME_PREFIX}{id}");
        let control_socket = state_dir.join(CONTROL_SOCKET);
        let (daemon, socks_addr) = self.launch_daemon(state_dir, &control_socket).await?;
        self.login(&control_socket, &hostname).await?;
        info!(hostname = %hostname, "joined mesh network");

        Ok(TailscaleSession {
            hostname,
            socks_addr,
            control_socket,
            tailscale_bin: self.tailscale_bin.clone(),
            _daemon: Mutex::new(daemon),
        })
    }

    async fn login(&self, control_socket: &Utf8Path, hostname: &str) -> Result<(), TunnelError> {
        let pending = Command::new(&self.tailscale_bin)
            .arg(format!("--socket={control_socket}"))
            .arg("up")
            .arg(format!("--authkey={}", self.network_key))
            .arg(format!("--login-server={}", self.control_url))
            .arg(format!("--hostname={hostname}"))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(self.login_timeout, pending)
            .await
            .map_err(|_| TunnelError::Login {
                message: format!("login did not finish within {:?}", self.login_timeout),
            })?
            .map_err(|err| TunnelError::Spawn {
                program: self.tailscale_bin.clone(),
                message: err.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        Err(TunnelError::Login {
            message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}

async fn reserve_loopback_port() -> Result<SocketAddr, TunnelError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    Ok(listener.local_addr()?)
}

impl SessionFactory for TailscaleSessionFactory {
    fn connect(&self) -> ProviderFuture<'_, Arc<dyn TunnelSession>, TunnelError> {
        Box::pin(async move {
            let id = Uuid::new_v4();
            let state_dir = self.base_path.join(SESSION_DIR).join(id.to_string());
            match self.start_session(id, &state_dir).await {
                Ok(session) => Ok(Arc::new(session) as Arc<dyn TunnelSession>),
                Err(err) => {
                    remove_state_dir(&state_dir).await;
                    Err(err)
                }
            }
        })
    }
}

async fn remove_state_dir(state_dir: &Utf8Path) {
    match tokio::fs::remove_dir_all(state_dir).await {
        Ok(()) => debug!(dir = %state_dir, "removed session state"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(dir = %state_dir, error = %err, "failed to remove session state"),
    }
}

/// Outcome of a failed daemon launch.
enum DaemonStart {
    /// The daemon exited before becoming ready; a new port may help.
    Exited(TunnelError),
    /// Any other failure.
    Failed(TunnelError),
}

/// Session backed by a running `tailscaled`. Dropping it stops the daemon.
struct TailscaleSession {
    hostname: String,
    socks_addr: SocketAddr,
    control_socket: Utf8PathBuf,
    tailscale_bin: String,
    _daemon: Mutex<Child>,
}

impl TunnelSession for TailscaleSession {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> ProviderFuture<'a, TunnelStream, TunnelError> {
        Box::pin(async move {
            let stream = Socks5Stream::connect(self.socks_addr, (host, port))
                .await
                .map_err(|err| TunnelError::Dial {
                    host: host.to_owned(),
                    port,
                    message: err.to_string(),
                })?;
            Ok(Box::new(stream) as TunnelStream)
        })
    }

    fn proxy_command(&self) -> String {
        format!(
            "{} --socket={} nc %h %p",
            shell_escape::escape(Cow::Borrowed(self.tailscale_bin.as_str())),
            shell_escape::escape(Cow::Borrowed(self.control_socket.as_str())),
        )
    }
}
