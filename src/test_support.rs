//! Test support utilities shared across unit and integration tests.
//!
//! The fakes here stand in for the remote APIs, the mesh session, the socket
//! forward transport and the log sink, so lifecycle behaviour can be driven
//! deterministically without network access or external binaries.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::{Mutex, MutexGuard, Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{
    DEFAULT_AGENT_SSH_PORT, DEFAULT_API_BASE_URL, DEFAULT_DAEMON_PORT, DEFAULT_LOGS_BASE_URL,
    DEFAULT_REMOTE_SOCKET, ProviderConfig, TargetOptions,
};
use crate::error::ProviderError;
use crate::logs::{LogPage, LogQuery, LogSource};
use crate::machines::{
    LaunchSpec, MachineHandle, MachineState, MachinesApi, ProviderFuture, VolumeRef,
    VolumeRequest,
};
use crate::provider::ApiFactory;
use crate::tunnel::{
    ForwardRequest, ForwardTransport, SessionFactory, TunnelError, TunnelSession, TunnelStream,
};

/// Returns a valid configuration rooted at `base` using forward mode.
#[must_use]
pub fn provider_config(base: &str) -> ProviderConfig {
    ProviderConfig {
        base_path: base.to_owned(),
        network_key: String::from("tskey-auth-test"),
        control_url: String::from("https://control.example.test"),
        local_sock_dir: format!("{base}/sockets"),
        tunnel_mode: String::from("forward"),
        agent_download_url: String::from("https://download.example.test/install.sh"),
        api_base_url: DEFAULT_API_BASE_URL.to_owned(),
        logs_base_url: DEFAULT_LOGS_BASE_URL.to_owned(),
        ssh_bin: String::from("ssh"),
        ssh_user: String::from("daytona"),
        ssh_port: DEFAULT_AGENT_SSH_PORT,
        daemon_port: DEFAULT_DAEMON_PORT,
        remote_socket: DEFAULT_REMOTE_SOCKET.to_owned(),
        tailscaled_bin: String::from("tailscaled"),
        tailscale_bin: String::from("tailscale"),
    }
}

/// Returns a minimal launch spec for a machine called `name`.
///
/// # Panics
///
/// Never in practice; the fixed image and size always build.
#[must_use]
#[expect(clippy::expect_used, reason = "fixture inputs are constant and valid")]
pub fn launch_spec(name: &str) -> LaunchSpec {
    LaunchSpec::builder()
        .name(name)
        .region("ams")
        .image("alpine:3")
        .size("shared-cpu-4x")
        .build()
        .expect("fixture launch spec should build")
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Response served by [`CannedHttpServer`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CannedResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl CannedResponse {
    /// A JSON response with `status` and `body`.
    #[must_use]
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_owned(),
        }
    }
}

/// Request captured by [`CannedHttpServer`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: String,
    /// Request target including any query string.
    pub path: String,
    /// Headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Returns the first header named `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Body decoded as JSON, or `Null` when it is not valid JSON.
    #[must_use]
    pub fn json_body(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

/// Minimal HTTP/1.1 server answering each connection with the next scripted
/// response, or `500` once the script is exhausted.
pub struct CannedHttpServer {
    addr: SocketAddr,
    requests: Arc<std::sync::Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for CannedHttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CannedHttpServer")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl CannedHttpServer {
    /// Binds to an ephemeral loopback port and starts serving `responses`.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn start(responses: Vec<CannedResponse>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            let mut script = VecDeque::from(responses);
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                if let Err(err) = serve_once(stream, &recorded, script.pop_front()).await {
                    tracing::debug!(error = %err, "canned connection failed");
                }
            }
        });
        Ok(Self {
            addr,
            requests,
            task,
        })
    }

    /// Base URL of the server, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests received so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for CannedHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_once(
    stream: TcpStream,
    recorded: &std::sync::Mutex<Vec<RecordedRequest>>,
    scripted: Option<CannedResponse>,
) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let mut request = RecordedRequest {
        method: parts.next().unwrap_or_default().to_owned(),
        path: parts.next().unwrap_or_default().to_owned(),
        ..RecordedRequest::default()
    };

    let mut content_length = 0_usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            let header_value = value.trim().to_owned();
            if key.eq_ignore_ascii_case("content-length") {
                content_length = header_value.parse().unwrap_or(0);
            }
            request.headers.push((key.trim().to_owned(), header_value));
        }
    }
    let mut body = vec![0_u8; content_length];
    reader.read_exact(&mut body).await?;
    request.body = body;
    recorded
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(request);

    let response =
        scripted.unwrap_or_else(|| CannedResponse::json(500, r#"{"error":"unscripted"}"#));
    let payload = format!(
        "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        response.body.len(),
        response.body
    );
    let mut stream = reader.into_inner();
    stream.write_all(payload.as_bytes()).await?;
    stream.shutdown().await
}

fn rejected(status: u16, operation: &str) -> ProviderError {
    ProviderError::RemoteApi {
        status,
        body: format!("{{\"error\":\"{operation} rejected by fake\"}}"),
    }
}

#[derive(Debug)]
struct FakeMachine {
    handle: MachineHandle,
    pending_probes: Option<usize>,
}

#[derive(Debug, Default)]
struct FakeMachinesState {
    apps: BTreeSet<String>,
    machines: BTreeMap<String, Vec<FakeMachine>>,
    volumes: Vec<VolumeRequest>,
    launched: Vec<LaunchSpec>,
    calls: Vec<String>,
    next_id: usize,
}

/// In-memory [`MachinesApi`] with scriptable readiness and failures.
///
/// Launched machines report `starting` until they have been listed
/// `ready_after` times, then `started`. Apps that were never created list
/// as empty.
#[derive(Clone, Debug)]
pub struct FakeMachinesApi {
    state: Arc<std::sync::Mutex<FakeMachinesState>>,
    ready_after: Option<usize>,
    failing_lists: Arc<AtomicUsize>,
    rejected_operations: BTreeSet<&'static str>,
}

impl Default for FakeMachinesApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMachinesApi {
    /// A fake whose launched machines are started on their first listing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(std::sync::Mutex::new(FakeMachinesState::default())),
            ready_after: Some(0),
            failing_lists: Arc::new(AtomicUsize::new(0)),
            rejected_operations: BTreeSet::new(),
        }
    }

    /// Launched machines stay `starting` for `listings` list calls.
    #[must_use]
    pub const fn ready_after(mut self, listings: usize) -> Self {
        self.ready_after = Some(listings);
        self
    }

    /// Launched machines never leave `starting`.
    #[must_use]
    pub const fn never_ready(mut self) -> Self {
        self.ready_after = None;
        self
    }

    /// The next `count` list calls fail with a 503.
    #[must_use]
    pub fn failing_lists(self, count: usize) -> Self {
        self.failing_lists.store(count, Ordering::SeqCst);
        self
    }

    /// Makes `operation` (for example `"create_app"`) fail with a 422.
    #[must_use]
    pub fn rejecting(mut self, operation: &'static str) -> Self {
        self.rejected_operations.insert(operation);
        self
    }

    /// Seeds an existing machine in `app`.
    #[must_use]
    pub fn with_machine(self, app: &str, handle: MachineHandle) -> Self {
        {
            let mut state = self.lock();
            state.apps.insert(app.to_owned());
            state
                .machines
                .entry(app.to_owned())
                .or_default()
                .push(FakeMachine {
                    handle,
                    pending_probes: None,
                });
        }
        self
    }

    /// Operations invoked so far, as `"<operation> <args>"` strings.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Volume requests received so far.
    #[must_use]
    pub fn volumes(&self) -> Vec<VolumeRequest> {
        self.lock().volumes.clone()
    }

    /// Launch specs received so far.
    #[must_use]
    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.lock().launched.clone()
    }

    /// Returns `true` while `app` exists.
    #[must_use]
    pub fn has_app(&self, app: &str) -> bool {
        self.lock().apps.contains(app)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeMachinesState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, operation: &'static str, detail: &str) -> Result<(), ProviderError> {
        self.lock().calls.push(format!("{operation} {detail}"));
        if self.rejected_operations.contains(operation) {
            return Err(rejected(422, operation));
        }
        Ok(())
    }

    fn set_state(
        &self,
        app: &str,
        machine_id: &str,
        target: MachineState,
    ) -> Result<(), ProviderError> {
        let mut state = self.lock();
        let machine = state
            .machines
            .get_mut(app)
            .and_then(|machines| machines.iter_mut().find(|m| m.handle.id == machine_id))
            .ok_or_else(|| rejected(404, "machine lookup"))?;
        machine.handle.state = target;
        machine.pending_probes = None;
        Ok(())
    }
}

impl MachinesApi for FakeMachinesApi {
    fn create_app<'a>(&'a self, app: &'a str, org: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record("create_app", &format!("{app} {org}"))?;
            self.lock().apps.insert(app.to_owned());
            Ok(())
        })
    }

    fn wait_for_app<'a>(&'a self, app: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record("wait_for_app", app)?;
            if self.has_app(app) {
                Ok(())
            } else {
                Err(ProviderError::timeout(format!("app {app} to appear"), Duration::ZERO))
            }
        })
    }

    fn create_volume<'a>(
        &'a self,
        app: &'a str,
        request: &'a VolumeRequest,
    ) -> ProviderFuture<'a, VolumeRef> {
        Box::pin(async move {
            self.record("create_volume", &format!("{app} {}", request.name))?;
            let mut state = self.lock();
            state.volumes.push(request.clone());
            Ok(VolumeRef {
                id: format!("vol_{}", state.volumes.len()),
                name: request.name.clone(),
            })
        })
    }

    fn launch_machine<'a>(
        &'a self,
        app: &'a str,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, MachineHandle> {
        Box::pin(async move {
            self.record("launch_machine", &format!("{app} {}", spec.name))?;
            let mut state = self.lock();
            state.next_id += 1;
            let handle = MachineHandle {
                id: format!("m{}", state.next_id),
                name: spec.name.clone(),
                state: MachineState::Starting,
                region: spec.region.clone(),
                created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single(),
                mounts: spec.mounts.clone(),
            };
            state.launched.push(spec.clone());
            state
                .machines
                .entry(app.to_owned())
                .or_default()
                .push(FakeMachine {
                    handle: handle.clone(),
                    pending_probes: self.ready_after,
                });
            Ok(handle)
        })
    }

    fn list_machines<'a>(&'a self, app: &'a str) -> ProviderFuture<'a, Vec<MachineHandle>> {
        Box::pin(async move {
            self.record("list_machines", app)?;
            let failing = self
                .failing_lists
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(rejected(503, "list_machines"));
            }
            let mut state = self.lock();
            let Some(machines) = state.machines.get_mut(app) else {
                return Ok(Vec::new());
            };
            for machine in machines.iter_mut() {
                if machine.handle.state != MachineState::Starting {
                    continue;
                }
                match machine.pending_probes {
                    Some(0) => {
                        machine.handle.state = MachineState::Started;
                        machine.pending_probes = None;
                    }
                    Some(remaining) => machine.pending_probes = Some(remaining - 1),
                    None => {}
                }
            }
            Ok(machines.iter().map(|machine| machine.handle.clone()).collect())
        })
    }

    fn start_machine<'a>(&'a self, app: &'a str, machine_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record("start_machine", &format!("{app} {machine_id}"))?;
            self.set_state(app, machine_id, MachineState::Started)
        })
    }

    fn stop_machine<'a>(&'a self, app: &'a str, machine_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record("stop_machine", &format!("{app} {machine_id}"))?;
            self.set_state(app, machine_id, MachineState::Stopped)
        })
    }

    fn destroy_machine<'a>(
        &'a self,
        app: &'a str,
        machine_id: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record("destroy_machine", &format!("{app} {machine_id}"))?;
            let mut state = self.lock();
            if let Some(machines) = state.machines.get_mut(app) {
                machines.retain(|machine| machine.handle.id != machine_id);
            }
            Ok(())
        })
    }

    fn destroy_app<'a>(&'a self, app: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record("destroy_app", app)?;
            let mut state = self.lock();
            state.machines.remove(app);
            if state.apps.remove(app) {
                Ok(())
            } else {
                Err(rejected(404, "destroy_app"))
            }
        })
    }
}

/// Log source replaying scripted pages, then pending forever.
#[derive(Clone, Debug, Default)]
pub struct ScriptedLogSource {
    pages: Arc<std::sync::Mutex<VecDeque<Result<LogPage, ProviderError>>>>,
    tokens: Arc<std::sync::Mutex<Vec<String>>>,
}

impl ScriptedLogSource {
    /// Creates a source returning `pages` in order.
    #[must_use]
    pub fn new(pages: Vec<Result<LogPage, ProviderError>>) -> Self {
        Self {
            pages: Arc::new(std::sync::Mutex::new(VecDeque::from(pages))),
            tokens: Arc::default(),
        }
    }

    /// Tokens passed to each fetch, in call order.
    #[must_use]
    pub fn requested_tokens(&self) -> Vec<String> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogSource for ScriptedLogSource {
    fn fetch_page<'a>(
        &'a self,
        _query: &'a LogQuery,
        token: &'a str,
    ) -> ProviderFuture<'a, LogPage> {
        Box::pin(async move {
            self.tokens
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(token.to_owned());
            let next = self
                .pages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match next {
                Some(page) => page,
                None => std::future::pending().await,
            }
        })
    }
}

/// [`ApiFactory`] handing out shared fakes and recording the tokens used.
#[derive(Clone, Debug, Default)]
pub struct FakeApiFactory {
    machines: FakeMachinesApi,
    logs: ScriptedLogSource,
    tokens: Arc<std::sync::Mutex<Vec<String>>>,
}

impl FakeApiFactory {
    /// Creates a factory serving `machines` and `logs`.
    #[must_use]
    pub fn new(machines: FakeMachinesApi, logs: ScriptedLogSource) -> Self {
        Self {
            machines,
            logs,
            tokens: Arc::default(),
        }
    }

    /// Auth tokens of every client built so far.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ApiFactory for FakeApiFactory {
    type Machines = FakeMachinesApi;
    type Logs = ScriptedLogSource;

    fn machines(&self, options: &TargetOptions) -> Self::Machines {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(options.auth_token().to_owned());
        self.machines.clone()
    }

    fn logs(&self, _options: &TargetOptions) -> Self::Logs {
        self.logs.clone()
    }
}

/// Mesh session whose dials return in-memory duplex streams.
#[derive(Debug)]
pub struct FakeSession {
    hostname: String,
    failing_dials: AtomicUsize,
    dials: std::sync::Mutex<Vec<(String, u16)>>,
}

impl FakeSession {
    /// Creates a session registered as `hostname`.
    #[must_use]
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_owned(),
            failing_dials: AtomicUsize::new(0),
            dials: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// The next `count` dials fail.
    #[must_use]
    pub fn failing_dials(self, count: usize) -> Self {
        self.failing_dials.store(count, Ordering::SeqCst);
        self
    }

    /// Every dial attempted, as `(host, port)`.
    #[must_use]
    pub fn dials(&self) -> Vec<(String, u16)> {
        self.dials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TunnelSession for FakeSession {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> ProviderFuture<'a, TunnelStream, TunnelError> {
        Box::pin(async move {
            self.dials
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((host.to_owned(), port));
            let failing = self
                .failing_dials
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TunnelError::Dial {
                    host: host.to_owned(),
                    port,
                    message: String::from("connection refused"),
                });
            }
            let (local, _remote) = tokio::io::duplex(1024);
            Ok(Box::new(local) as TunnelStream)
        })
    }

    fn proxy_command(&self) -> String {
        String::from("fake-proxy %h %p")
    }
}

/// Factory yielding one shared [`FakeSession`], optionally after a delay.
#[derive(Clone, Debug)]
pub struct FakeSessionFactory {
    session: Arc<FakeSession>,
    delay: Duration,
    failing_connects: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

impl FakeSessionFactory {
    /// Wraps `session`.
    #[must_use]
    pub fn new(session: FakeSession) -> Self {
        Self {
            session: Arc::new(session),
            delay: Duration::ZERO,
            failing_connects: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Each connect waits `delay` before completing.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The next `count` connects fail with a login error.
    #[must_use]
    pub fn failing_connects(self, count: usize) -> Self {
        self.failing_connects.store(count, Ordering::SeqCst);
        self
    }

    /// Shared counter of connect calls.
    #[must_use]
    pub fn connect_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connects)
    }

    /// The session handed out by this factory.
    #[must_use]
    pub fn session(&self) -> Arc<FakeSession> {
        Arc::clone(&self.session)
    }
}

impl SessionFactory for FakeSessionFactory {
    fn connect(&self) -> ProviderFuture<'_, Arc<dyn TunnelSession>, TunnelError> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failing = self
                .failing_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TunnelError::Login {
                    message: String::from("auth key rejected"),
                });
            }
            Ok(Arc::clone(&self.session) as Arc<dyn TunnelSession>)
        })
    }
}

/// Forward transport serving an echo server on the local socket until
/// [`FakeForwardTransport::break_forward`] is called.
#[derive(Clone, Debug, Default)]
pub struct FakeForwardTransport {
    runs: Arc<AtomicUsize>,
    failing_starts: Arc<AtomicUsize>,
    stop: Arc<Notify>,
}

impl FakeForwardTransport {
    /// Creates a transport whose forwards start successfully.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` runs fail before becoming ready.
    #[must_use]
    pub fn failing_starts(self, count: usize) -> Self {
        self.failing_starts.store(count, Ordering::SeqCst);
        self
    }

    /// Number of forwards started.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Makes the running forward fail.
    pub fn break_forward(&self) {
        self.stop.notify_one();
    }
}

async fn echo(mut stream: tokio::net::UnixStream) {
    let (mut reader, mut writer) = stream.split();
    if tokio::io::copy(&mut reader, &mut writer).await.is_err() {
        tracing::debug!("echo connection closed with an error");
    }
}

impl ForwardTransport for FakeForwardTransport {
    fn run(
        &self,
        session: Arc<dyn TunnelSession>,
        request: ForwardRequest,
        ready: oneshot::Sender<()>,
    ) -> ProviderFuture<'_, (), TunnelError> {
        Box::pin(async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failing_starts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TunnelError::Forward {
                    hostname: request.hostname,
                    message: format!("ssh via {} refused", session.hostname()),
                });
            }
            let listener = UnixListener::bind(&request.local_socket)?;
            if ready.send(()).is_err() {
                tracing::debug!("nobody waiting for fake forward");
            }
            loop {
                tokio::select! {
                    () = self.stop.notified() => {
                        return Err(TunnelError::Forward {
                            hostname: request.hostname,
                            message: String::from("connection reset"),
                        });
                    }
                    accepted = listener.accept() => {
                        let (stream, _) = accepted?;
                        tokio::spawn(echo(stream));
                    }
                }
            }
        })
    }
}

/// One write observed by [`CaptureSink`].
#[derive(Clone, Debug)]
pub struct CapturedWrite {
    /// Time of the write on the tokio clock.
    pub at: Instant,
    /// Bytes written.
    pub bytes: Vec<u8>,
}

impl CapturedWrite {
    /// Bytes as lossy UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Async writer recording every write with its timestamp.
#[derive(Clone, Debug, Default)]
pub struct CaptureSink {
    writes: Arc<std::sync::Mutex<Vec<CapturedWrite>>>,
    notify: Arc<Notify>,
    failing: bool,
}

impl CaptureSink {
    /// A sink that rejects every write.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Writes recorded so far.
    #[must_use]
    pub fn writes(&self) -> Vec<CapturedWrite> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All recorded bytes concatenated as text.
    #[must_use]
    pub fn contents(&self) -> String {
        self.writes().iter().map(CapturedWrite::text).collect()
    }

    /// Waits until at least `count` writes have been recorded.
    pub async fn wait_for_writes(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.writes.lock().unwrap_or_else(PoisonError::into_inner).len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl AsyncWrite for CaptureSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.failing {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")));
        }
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CapturedWrite {
                at: Instant::now(),
                bytes: buf.to_vec(),
            });
        self.notify.notify_waiters();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
