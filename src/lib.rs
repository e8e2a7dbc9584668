//! Core library for the `fly-provider` development-machine provider.
//!
//! The crate provisions machines through a remote Machines API, waits for
//! them to become ready, reaches their container daemon through a private
//! mesh-network session and streams their logs back to the caller
//! (create → wait for readiness → dial the agent → connect the daemon).

pub mod config;
pub mod error;
mod http;
pub mod logs;
pub mod machines;
pub mod naming;
pub mod provider;
pub mod readiness;
pub mod supervisor;
pub mod test_support;
pub mod tunnel;

pub use config::{ConfigError, ProviderConfig, TargetOptions, TunnelMode};
pub use error::ProviderError;
pub use logs::{FlyLogClient, LogEntry, LogSink, LogSource, LogStreamer};
pub use machines::{FlyMachinesClient, MachineHandle, MachineState, MachinesApi};
pub use provider::{
    ApiFactory, CreatedTarget, FlyApiFactory, FlyProvider, ProviderInfo, TargetMetadata,
    TargetRequest,
};
pub use readiness::ReadinessPoller;
pub use supervisor::{TaskFailure, TaskSupervisor};
pub use tunnel::{DaemonConnector, TunnelError, TunnelManager, TunnelSession};
