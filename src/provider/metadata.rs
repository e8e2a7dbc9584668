//! Provider-facing descriptions of targets and of the provider itself.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{TargetConfigProperty, target_config_manifest};
use crate::machines::{MachineHandle, MachineState};

/// Name the provider registers under.
pub const PROVIDER_NAME: &str = "fly-provider";

/// Human-readable provider label.
pub const PROVIDER_LABEL: &str = "Fly.io";

/// Snapshot of a target's machine, serialised for the host orchestrator.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TargetMetadata {
    /// Provider machine identifier.
    pub machine_id: String,
    /// Identifier of the first mounted volume; empty when nothing is mounted.
    pub volume_id: String,
    /// Whether the machine is started.
    pub is_running: bool,
    /// Creation timestamp, when reported.
    pub created: Option<DateTime<Utc>>,
}

impl From<&MachineHandle> for TargetMetadata {
    fn from(machine: &MachineHandle) -> Self {
        Self {
            machine_id: machine.id.clone(),
            volume_id: machine
                .mounts
                .first()
                .map(|mount| mount.volume.clone())
                .unwrap_or_default(),
            is_running: machine.state == MachineState::Started,
            created: machine.created_at,
        }
    }
}

/// Identity and option manifest advertised to the host orchestrator.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProviderInfo {
    /// Registered name.
    pub name: String,
    /// Display label.
    pub label: String,
    /// Crate version.
    pub version: String,
    /// Accepted target options.
    pub target_config_manifest: BTreeMap<String, TargetConfigProperty>,
}

impl ProviderInfo {
    /// Describes this build of the provider.
    #[must_use]
    pub fn current() -> Self {
        Self {
            name: PROVIDER_NAME.to_owned(),
            label: PROVIDER_LABEL.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            target_config_manifest: target_config_manifest(),
        }
    }
}
