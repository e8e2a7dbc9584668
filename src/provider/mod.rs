//! Target lifecycle operations tying the subsystems together.
//!
//! A [`FlyProvider`] owns the mesh tunnel, the daemon connector and the
//! background task supervisor for its whole lifetime. API clients are built
//! per call from the target's options through an [`ApiFactory`].
//!
//! Callers must not run concurrent lifecycle operations for the same target;
//! nothing here serialises them.

mod factory;
mod metadata;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ProviderConfig, TargetOptions, TunnelMode};
use crate::error::ProviderError;
use crate::logs::{LOG_IDLE_DELAY, LogQuery, LogSink, LogStreamer};
use crate::machines::{
    LaunchSpec, MachineHandle, MachineMount, MachineState, MachinesApi, VolumeRequest,
};
use crate::naming::{resource_name, volume_name};
use crate::readiness::ReadinessPoller;
use crate::supervisor::TaskSupervisor;
use crate::tunnel::{
    DaemonConnector, DirectDialConnector, ForwardedSocketConnector, SocketForwarder,
    SshForwardTransport, TailscaleSessionFactory, TunnelManager, TunnelStream,
};

pub use factory::{ApiFactory, FlyApiFactory};
pub use metadata::{PROVIDER_LABEL, PROVIDER_NAME, ProviderInfo, TargetMetadata};

/// Upper bound on waiting for the agent's SSH port after launch.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything needed to act on one target.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct TargetRequest {
    /// Target identifier; names the app and is the machine's mesh host name.
    pub id: String,
    /// Target name; names the machine and its volume.
    pub name: String,
    /// Image the machine runs.
    pub image: String,
    /// Remote user; the volume mounts at `/home/<user>`.
    pub user: String,
    /// Environment passed to the machine.
    pub env: BTreeMap<String, String>,
    /// Key the init script uses to download the agent.
    pub api_key: String,
    /// Target options as a JSON document.
    pub options: String,
}

impl std::fmt::Debug for TargetRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRequest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("image", &self.image)
            .field("user", &self.user)
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Result of a successful [`FlyProvider::create_target`].
pub struct CreatedTarget {
    /// The launched machine as last observed by the readiness poller.
    pub machine: MachineHandle,
    /// Open connection to the machine's container daemon.
    pub daemon: TunnelStream,
}

impl std::fmt::Debug for CreatedTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedTarget")
            .field("machine", &self.machine)
            .finish_non_exhaustive()
    }
}

/// Builds the machine entrypoint script that installs and starts the agent.
#[must_use]
pub fn init_script(api_key: &str, download_url: &str) -> String {
    let header = format!("Authorization: Bearer {api_key}");
    format!(
        "apk add --no-cache curl bash && curl -sfL -H {} {} | bash",
        shell_escape::escape(header.into()),
        shell_escape::escape(download_url.into()),
    )
}

/// Writes a line to the sink, logging rather than failing on sink errors.
async fn note(sink: &LogSink, text: &str) {
    if let Err(err) = sink.write_line(text).await {
        warn!(error = %err, "failed to write to target log sink");
    }
}

/// Mirrors a failed step to the sink before handing the result back.
async fn report<T, E>(
    sink: &LogSink,
    context: &str,
    result: Result<T, E>,
) -> Result<T, ProviderError>
where
    E: Into<ProviderError>,
{
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            let error = err.into();
            note(sink, &format!("{context}: {error}\n")).await;
            Err(error)
        }
    }
}

async fn resolve_options(
    request: &TargetRequest,
    sink: &LogSink,
) -> Result<TargetOptions, ProviderError> {
    report(
        sink,
        "Failed to parse target options",
        TargetOptions::parse(&request.options),
    )
    .await
}

/// Provisions, inspects and tears down targets.
pub struct FlyProvider<F: ApiFactory = FlyApiFactory> {
    apis: F,
    tunnel: Arc<TunnelManager>,
    connector: Arc<dyn DaemonConnector>,
    supervisor: Arc<TaskSupervisor>,
    agent_download_url: String,
    ssh_port: u16,
    poller: ReadinessPoller,
    dial_timeout: Duration,
    log_idle_delay: Duration,
}

impl<F: ApiFactory> std::fmt::Debug for FlyProvider<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlyProvider")
            .field("tunnel", &self.tunnel)
            .field("ssh_port", &self.ssh_port)
            .field("poller", &self.poller)
            .field("dial_timeout", &self.dial_timeout)
            .finish_non_exhaustive()
    }
}

impl FlyProvider<FlyApiFactory> {
    /// Builds a provider backed by the real APIs, a `tailscaled` session and
    /// the connector selected by `config.tunnel_mode`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] when `config` fails
    /// validation.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        config.validate()?;
        let supervisor = Arc::new(TaskSupervisor::new());
        let tunnel = Arc::new(TunnelManager::new(TailscaleSessionFactory::from_config(
            config,
        )));
        let connector: Arc<dyn DaemonConnector> = match config.tunnel_mode()? {
            TunnelMode::Forward => {
                let transport = SshForwardTransport::new(&config.ssh_bin, &config.ssh_user);
                Arc::new(ForwardedSocketConnector::new(
                    Arc::clone(&tunnel),
                    SocketForwarder::new(Arc::new(transport), Arc::clone(&supervisor)),
                    &config.local_sock_dir(),
                    config.remote_socket.clone(),
                    config.ssh_port,
                ))
            }
            TunnelMode::Direct => Arc::new(DirectDialConnector::new(
                Arc::clone(&tunnel),
                config.daemon_port,
            )),
        };
        let apis = FlyApiFactory::new(&config.api_base_url, &config.logs_base_url);
        Ok(Self::new(config, apis, tunnel, connector, supervisor))
    }
}

impl<F: ApiFactory> FlyProvider<F> {
    /// Assembles a provider from explicit parts.
    #[must_use]
    pub fn new(
        config: &ProviderConfig,
        apis: F,
        tunnel: Arc<TunnelManager>,
        connector: Arc<dyn DaemonConnector>,
        supervisor: Arc<TaskSupervisor>,
    ) -> Self {
        Self {
            apis,
            tunnel,
            connector,
            supervisor,
            agent_download_url: config.agent_download_url.clone(),
            ssh_port: config.ssh_port,
            poller: ReadinessPoller::default(),
            dial_timeout: DIAL_TIMEOUT,
            log_idle_delay: LOG_IDLE_DELAY,
        }
    }

    /// Overrides the readiness poller.
    #[must_use]
    pub const fn with_poller(mut self, poller: ReadinessPoller) -> Self {
        self.poller = poller;
        self
    }

    /// Overrides the post-launch dial timeout.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Overrides the idle delay of background log streams.
    #[must_use]
    pub const fn with_log_idle_delay(mut self, delay: Duration) -> Self {
        self.log_idle_delay = delay;
        self
    }

    /// Supervisor owning this provider's background tasks.
    #[must_use]
    pub const fn supervisor(&self) -> &Arc<TaskSupervisor> {
        &self.supervisor
    }

    /// The provider's tunnel manager.
    #[must_use]
    pub const fn tunnel(&self) -> &Arc<TunnelManager> {
        &self.tunnel
    }

    /// Identity and option manifest.
    #[must_use]
    #[expect(
        clippy::unused_self,
        reason = "kept as a method so callers need no type parameters"
    )]
    pub fn provider_info(&self) -> ProviderInfo {
        ProviderInfo::current()
    }

    /// Builds and validates the launch spec ahead of any remote call. The
    /// volume mount is added once the volume exists.
    fn launch_spec(
        &self,
        options: &TargetOptions,
        request: &TargetRequest,
        machine_name: &str,
    ) -> Result<LaunchSpec, ProviderError> {
        LaunchSpec::builder()
            .name(machine_name)
            .region(&options.region)
            .image(&request.image)
            .size(&options.size)
            .env(request.env.clone())
            .entrypoint(vec![
                String::from("bash"),
                String::from("-c"),
                init_script(&request.api_key, &self.agent_download_url),
            ])
            .build()
    }

    async fn provision(
        api: &F::Machines,
        options: &TargetOptions,
        request: &TargetRequest,
        app: &str,
        mut spec: LaunchSpec,
    ) -> Result<MachineHandle, ProviderError> {
        api.create_app(app, &options.org_slug).await?;
        let volume = api
            .create_volume(
                app,
                &VolumeRequest {
                    name: volume_name(&request.name),
                    size_gb: options.disk_size,
                    region: options.region.clone(),
                },
            )
            .await?;
        spec.mounts.push(MachineMount {
            volume: volume.id,
            name: volume.name,
            path: format!("/home/{}", request.user),
            size_gb: options.disk_size,
        });
        api.launch_machine(app, &spec).await
    }

    fn spawn_log_stream(
        &self,
        options: &TargetOptions,
        app: &str,
        machine_id: &str,
        sink: LogSink,
    ) {
        let streamer =
            LogStreamer::new(self.apis.logs(options)).with_idle_delay(self.log_idle_delay);
        let query = LogQuery {
            app: app.to_owned(),
            region: options.region.clone(),
            machine_id: machine_id.to_owned(),
        };
        self.supervisor.spawn(format!("logs:{app}"), async move {
            match streamer.stream(&query, &sink).await {
                Ok(never) => match never {},
                Err(err) => {
                    note(&sink, &format!("log streaming stopped: {err}\n")).await;
                    Err(err)
                }
            }
        });
    }

    /// Creates the app, volume and machine for `request`, then waits until
    /// the machine is ready and its agent answers on the mesh.
    ///
    /// Log streaming for the machine starts in the background as soon as it
    /// is launched and is not awaited. Progress and failures are echoed to
    /// `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] for bad options or launch
    /// inputs (such as an empty image) before any remote call,
    /// [`ProviderError::RemoteApi`] for rejected API calls,
    /// [`ProviderError::Timeout`] when readiness or the dial wait expires,
    /// and [`ProviderError::Tunnel`] when the daemon connection fails.
    pub async fn create_target(
        &self,
        request: &TargetRequest,
        sink: &LogSink,
    ) -> Result<CreatedTarget, ProviderError> {
        let options = resolve_options(request, sink).await?;
        let app = resource_name(&request.id);
        let machine_name = resource_name(&request.name);

        let spec = report(
            sink,
            "Failed to create target",
            self.launch_spec(&options, request, &machine_name),
        )
        .await?;
        let api = self.apis.machines(&options);

        let launched = report(
            sink,
            "Failed to create target",
            Self::provision(&api, &options, request, &app, spec).await,
        )
        .await?;
        info!(app = %app, machine = %launched.id, "machine launched");
        self.spawn_log_stream(&options, &app, &launched.id, sink.clone());

        let machine = report(
            sink,
            "Machine did not become ready",
            self.poller.wait_until_ready(&api, &app, &machine_name).await,
        )
        .await?;
        report(
            sink,
            "Failed to dial",
            self.tunnel
                .wait_for_dial(&request.id, self.ssh_port, self.dial_timeout)
                .await,
        )
        .await?;
        note(sink, "target agent started.\n").await;

        let daemon = report(
            sink,
            "Failed to get client",
            self.connector.connect(&request.id).await,
        )
        .await?;
        Ok(CreatedTarget { machine, daemon })
    }

    /// Starts the target's machine if it is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotFound`] when no machine carries the
    /// derived name, or the API error that stopped the operation.
    pub async fn start_target(
        &self,
        request: &TargetRequest,
        sink: &LogSink,
    ) -> Result<(), ProviderError> {
        let options = resolve_options(request, sink).await?;
        let api = self.apis.machines(&options);
        let app = resource_name(&request.id);
        let outcome = async {
            api.wait_for_app(&app).await?;
            let machine = api
                .find_machine_by_name(&app, &resource_name(&request.name))
                .await?;
            if machine.state == MachineState::Stopped {
                api.start_machine(&app, &machine.id).await?;
            } else {
                debug!(app = %app, state = %machine.state, "machine not stopped; start skipped");
            }
            Ok::<_, ProviderError>(())
        }
        .await;
        report(sink, "Failed to start target", outcome).await
    }

    /// Stops the target's machine unless it is already stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotFound`] when no machine carries the
    /// derived name, or the API error that stopped the operation.
    pub async fn stop_target(
        &self,
        request: &TargetRequest,
        sink: &LogSink,
    ) -> Result<(), ProviderError> {
        let options = resolve_options(request, sink).await?;
        let api = self.apis.machines(&options);
        let app = resource_name(&request.id);
        let outcome = async {
            let machine = api
                .find_machine_by_name(&app, &resource_name(&request.name))
                .await?;
            if machine.state == MachineState::Stopped {
                debug!(app = %app, "machine already stopped");
                return Ok(());
            }
            api.stop_machine(&app, &machine.id).await
        }
        .await;
        report(sink, "Failed to stop target", outcome).await
    }

    /// Destroys the target's machine, when present, and then its app.
    ///
    /// # Errors
    ///
    /// Returns the API error that stopped the operation. A machine that is
    /// already gone is not an error.
    pub async fn destroy_target(
        &self,
        request: &TargetRequest,
        sink: &LogSink,
    ) -> Result<(), ProviderError> {
        let options = resolve_options(request, sink).await?;
        let api = self.apis.machines(&options);
        let app = resource_name(&request.id);
        let outcome = async {
            match api
                .find_machine_by_name(&app, &resource_name(&request.name))
                .await
            {
                Ok(machine) => api.destroy_machine(&app, &machine.id).await?,
                Err(err) if err.is_not_found() => {
                    debug!(app = %app, "no machine to destroy");
                }
                Err(err) => return Err(err),
            }
            api.destroy_app(&app).await
        }
        .await;
        report(sink, "Failed to destroy target", outcome).await?;
        info!(app = %app, "target destroyed");
        Ok(())
    }

    /// Describes the target's machine.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotFound`] when no machine carries the
    /// derived name.
    pub async fn target_metadata(
        &self,
        request: &TargetRequest,
        sink: &LogSink,
    ) -> Result<TargetMetadata, ProviderError> {
        let options = resolve_options(request, sink).await?;
        let api = self.apis.machines(&options);
        let machine = report(
            sink,
            "Failed to get machine",
            api.find_machine_by_name(
                &resource_name(&request.id),
                &resource_name(&request.name),
            )
            .await,
        )
        .await?;
        Ok(TargetMetadata::from(&machine))
    }

    /// Opens a connection to the container daemon on the target's machine
    /// using the configured tunnel strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Tunnel`] when the session or connection fails.
    pub async fn daemon_connection(
        &self,
        request: &TargetRequest,
    ) -> Result<TunnelStream, ProviderError> {
        Ok(self.connector.connect(&request.id).await?)
    }

    /// Streams the machine's logs into `sink` in the foreground.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the stream; the function never returns
    /// `Ok`.
    pub async fn stream_logs(
        &self,
        request: &TargetRequest,
        machine_id: &str,
        sink: &LogSink,
    ) -> Result<Infallible, ProviderError> {
        let options = resolve_options(request, sink).await?;
        let streamer =
            LogStreamer::new(self.apis.logs(&options)).with_idle_delay(self.log_idle_delay);
        let query = LogQuery {
            app: resource_name(&request.id),
            region: options.region.clone(),
            machine_id: machine_id.to_owned(),
        };
        streamer.stream(&query, sink).await
    }
}
