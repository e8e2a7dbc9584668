//! Shared fixtures for lifecycle BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use fly_provider::machines::{MachineMount, MachineState};
use fly_provider::test_support::{
    CaptureSink, FakeApiFactory, FakeForwardTransport, FakeMachinesApi, FakeSession,
    FakeSessionFactory, ScriptedLogSource, provider_config,
};
use fly_provider::tunnel::{ForwardedSocketConnector, SocketForwarder};
use fly_provider::{
    FlyProvider, LogSink, MachineHandle, ProviderError, ReadinessPoller, TargetRequest,
    TaskSupervisor, TunnelManager,
};
use rstest::fixture;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const TARGET_ID: &str = "t1";
pub const APP: &str = "devbox-t1";
pub const AGENT_PORT: u16 = 2222;

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub machines: FakeMachinesApi,
    pub request: TargetRequest,
    pub failing_dials: usize,
    pub outcome: Option<LifecycleOutcome>,
}

#[derive(Clone, Debug, Default)]
pub struct LifecycleOutcome {
    pub error: Option<ProviderError>,
    pub machine_state: Option<MachineState>,
    pub agent_dials: usize,
    pub echoed: Vec<u8>,
    pub forward_runs: usize,
    pub sink: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Create,
    Destroy,
    Metadata,
}

#[derive(Clone, Debug, Error)]
pub enum LifecycleTestError {
    #[error("test runtime: {0}")]
    Runtime(String),
    #[error("invalid lifecycle fixture: {0}")]
    Fixture(String),
}

pub type LifecycleContextResult = Result<LifecycleContext, LifecycleTestError>;

#[fixture]
pub fn lifecycle_context_result() -> LifecycleContextResult {
    Ok(LifecycleContext {
        machines: FakeMachinesApi::new(),
        request: TargetRequest {
            id: String::from(TARGET_ID),
            name: String::from("ws"),
            image: String::from("alpine:3"),
            user: String::from("daytona"),
            env: std::collections::BTreeMap::new(),
            api_key: String::from("agent-key"),
            options: String::from(r#"{"Region":"ams","Org Slug":"acme","Auth Token":"tok"}"#),
        },
        failing_dials: 0,
        outcome: None,
    })
}

#[fixture]
pub fn lifecycle_context(lifecycle_context_result: LifecycleContextResult) -> LifecycleContext {
    lifecycle_context_result
        .unwrap_or_else(|err| panic!("lifecycle context fixture should initialise: {err}"))
}

pub fn existing_machine() -> MachineHandle {
    MachineHandle {
        id: String::from("m7"),
        name: String::from("devbox-ws"),
        state: MachineState::Started,
        region: String::from("ams"),
        created_at: None,
        mounts: vec![MachineMount {
            volume: String::from("vol_7"),
            name: String::from("devbox_ws"),
            path: String::from("/home/daytona"),
            size_gb: 10,
        }],
    }
}

/// Runs `operation` against a provider wired to the context's fakes, using
/// forward mode with a temporary socket directory and paused time.
pub fn run_operation(
    context: &LifecycleContext,
    operation: Operation,
) -> Result<LifecycleOutcome, LifecycleTestError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|err| LifecycleTestError::Runtime(err.to_string()))?;
    let dir = tempfile::tempdir().map_err(|err| LifecycleTestError::Fixture(err.to_string()))?;
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .map_err(|path| LifecycleTestError::Fixture(path.display().to_string()))?;

    runtime.block_on(async move {
        let config = provider_config(root.as_str());
        let sessions = FakeSessionFactory::new(
            FakeSession::new("fly-provider-bdd").failing_dials(context.failing_dials),
        );
        let session = sessions.session();
        let tunnel = Arc::new(TunnelManager::new(sessions));
        let supervisor = Arc::new(TaskSupervisor::new());
        let transport = FakeForwardTransport::new();
        let connector = Arc::new(ForwardedSocketConnector::new(
            Arc::clone(&tunnel),
            SocketForwarder::new(Arc::new(transport.clone()), Arc::clone(&supervisor)),
            &config.local_sock_dir(),
            config.remote_socket.clone(),
            config.ssh_port,
        ));
        let apis = FakeApiFactory::new(context.machines.clone(), ScriptedLogSource::default());
        let provider = FlyProvider::new(&config, apis, tunnel, connector, supervisor)
            .with_poller(ReadinessPoller::new(
                Duration::from_millis(200),
                Duration::from_secs(10),
            ))
            .with_dial_timeout(Duration::from_secs(30));
        let capture = CaptureSink::default();
        let sink = LogSink::new(capture.clone());

        let mut outcome = LifecycleOutcome::default();
        match operation {
            Operation::Create => match provider.create_target(&context.request, &sink).await {
                Ok(mut created) => {
                    outcome.machine_state = Some(created.machine.state);
                    outcome.echoed = echo_through(&mut created.daemon).await?;
                }
                Err(err) => outcome.error = Some(err),
            },
            Operation::Destroy => {
                outcome.error = provider.destroy_target(&context.request, &sink).await.err();
            }
            Operation::Metadata => {
                outcome.error = provider
                    .target_metadata(&context.request, &sink)
                    .await
                    .err();
            }
        }

        outcome.agent_dials = session
            .dials()
            .iter()
            .filter(|(host, port)| host == TARGET_ID && *port == AGENT_PORT)
            .count();
        outcome.forward_runs = transport.runs();
        outcome.sink = capture.contents();
        drop(dir);
        Ok(outcome)
    })
}

async fn echo_through(
    stream: &mut fly_provider::tunnel::TunnelStream,
) -> Result<Vec<u8>, LifecycleTestError> {
    stream
        .write_all(b"ping")
        .await
        .map_err(|err| LifecycleTestError::Fixture(err.to_string()))?;
    let mut reply = vec![0_u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|err| LifecycleTestError::Fixture(err.to_string()))?;
    Ok(reply)
}
