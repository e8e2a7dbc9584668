//! Construction of per-call API clients from resolved target options.

use crate::config::TargetOptions;
use crate::logs::{FlyLogClient, LogSource};
use crate::machines::{FlyMachinesClient, MachinesApi};

/// Builds API clients for a target's credentials.
///
/// Clients are created per lifecycle call because each target may carry its
/// own token.
pub trait ApiFactory: Send + Sync {
    /// Machines client type.
    type Machines: MachinesApi;
    /// Log source type; moved into a background task, so it must be `'static`.
    type Logs: LogSource + 'static;

    /// Returns a machines client authorised by `options`.
    fn machines(&self, options: &TargetOptions) -> Self::Machines;

    /// Returns a log source authorised by `options`.
    fn logs(&self, options: &TargetOptions) -> Self::Logs;
}

/// Factory producing HTTP clients for the real APIs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlyApiFactory {
    api_base_url: String,
    logs_base_url: String,
}

impl FlyApiFactory {
    /// Creates a factory targeting the given base URLs.
    #[must_use]
    pub fn new(api_base_url: impl Into<String>, logs_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            logs_base_url: logs_base_url.into(),
        }
    }
}

impl ApiFactory for FlyApiFactory {
    type Machines = FlyMachinesClient;
    type Logs = FlyLogClient;

    fn machines(&self, options: &TargetOptions) -> Self::Machines {
        FlyMachinesClient::new(&self.api_base_url, options.auth_token())
    }

    fn logs(&self, options: &TargetOptions) -> Self::Logs {
        FlyLogClient::new(&self.logs_base_url, options.auth_token())
    }
}
