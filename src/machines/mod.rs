//! Remote control-plane abstraction for apps, volumes and machines.

mod client;
mod wire;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

pub use client::FlyMachinesClient;

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E = ProviderError> =
    Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Lifecycle state reported for a machine.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Created but never started.
    Created,
    /// Booting.
    Starting,
    /// Running.
    Started,
    /// Shutting down.
    Stopping,
    /// Stopped; can be started again.
    Stopped,
    /// Being destroyed.
    Destroying,
    /// Gone.
    Destroyed,
    /// Any state this crate does not model.
    #[serde(other)]
    Unknown,
}

impl MachineState {
    /// States in which a machine exists and can be inspected.
    pub const KNOWN_GOOD: [Self; 3] = [Self::Created, Self::Started, Self::Stopped];

    /// Returns `true` when the state is in [`MachineState::KNOWN_GOOD`].
    #[must_use]
    pub fn is_known_good(self) -> bool {
        Self::KNOWN_GOOD.contains(&self)
    }

    /// Wire representation of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volume attached to a machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineMount {
    /// Volume identifier.
    pub volume: String,
    /// Volume name.
    pub name: String,
    /// Mount point inside the machine.
    pub path: String,
    /// Size in GB.
    pub size_gb: u32,
}

/// The provider's view of a compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineHandle {
    /// Opaque provider identifier.
    pub id: String,
    /// Derived machine name.
    pub name: String,
    /// Last reported state.
    pub state: MachineState,
    /// Region the machine runs in.
    pub region: String,
    /// Creation timestamp, when reported.
    pub created_at: Option<DateTime<Utc>>,
    /// Mounted volumes.
    pub mounts: Vec<MachineMount>,
}

/// Parameters for creating a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeRequest {
    /// Sanitised volume name.
    pub name: String,
    /// Size in GB.
    pub size_gb: u32,
    /// Target region; empty lets the provider choose.
    pub region: String,
}

/// Handle returned after creating a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeRef {
    /// Provider-specific volume identifier.
    pub id: String,
    /// Volume name.
    pub name: String,
}

/// Parameters required to launch a machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Derived machine name.
    pub name: String,
    /// Target region; empty lets the provider choose.
    pub region: String,
    /// Image reference.
    pub image: String,
    /// Size preset (for example `shared-cpu-4x`).
    pub size: String,
    /// Environment variables passed to the machine.
    pub env: BTreeMap<String, String>,
    /// Volumes to mount.
    pub mounts: Vec<MachineMount>,
    /// Entrypoint replacing the image's init command.
    pub entrypoint: Vec<String>,
}

impl LaunchSpec {
    /// Starts a builder for a [`LaunchSpec`].
    #[must_use]
    pub fn builder() -> LaunchSpecBuilder {
        LaunchSpecBuilder::default()
    }
}

/// Builder for [`LaunchSpec`] that trims and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchSpecBuilder {
    name: String,
    region: String,
    image: String,
    size: String,
    env: BTreeMap<String, String>,
    mounts: Vec<MachineMount>,
    entrypoint: Vec<String>,
}

impl LaunchSpecBuilder {
    /// Sets the machine name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = value.into();
        self
    }

    /// Sets the image reference.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the size preset.
    #[must_use]
    pub fn size(mut self, value: impl Into<String>) -> Self {
        self.size = value.into();
        self
    }

    /// Replaces the environment variables.
    #[must_use]
    pub fn env(mut self, value: BTreeMap<String, String>) -> Self {
        self.env = value;
        self
    }

    /// Adds a volume mount.
    #[must_use]
    pub fn mount(mut self, value: MachineMount) -> Self {
        self.mounts.push(value);
        self
    }

    /// Sets the entrypoint, typically `bash -c <script>`.
    #[must_use]
    pub fn entrypoint(mut self, value: Vec<String>) -> Self {
        self.entrypoint = value;
        self
    }

    /// Builds the spec, trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] when the name, image or size
    /// is empty.
    pub fn build(self) -> Result<LaunchSpec, ProviderError> {
        let spec = LaunchSpec {
            name: self.name.trim().to_owned(),
            region: self.region.trim().to_owned(),
            image: self.image.trim().to_owned(),
            size: self.size.trim().to_owned(),
            env: self.env,
            mounts: self.mounts,
            entrypoint: self.entrypoint,
        };
        for (field, value) in [
            ("name", &spec.name),
            ("image", &spec.image),
            ("size", &spec.size),
        ] {
            if value.is_empty() {
                return Err(ProviderError::Configuration(format!(
                    "launch spec is missing {field}"
                )));
            }
        }
        Ok(spec)
    }
}

/// Machine-management operations of the remote compute provider.
///
/// Calls are not deduplicated; callers must not issue concurrent operations
/// for the same machine.
pub trait MachinesApi: Send + Sync {
    /// Creates the app in `org` and blocks until the provider reports it ready.
    fn create_app<'a>(&'a self, app: &'a str, org: &'a str) -> ProviderFuture<'a, ()>;

    /// Blocks until the app is visible through the API.
    fn wait_for_app<'a>(&'a self, app: &'a str) -> ProviderFuture<'a, ()>;

    /// Creates a volume; must precede the launch that mounts it.
    fn create_volume<'a>(
        &'a self,
        app: &'a str,
        request: &'a VolumeRequest,
    ) -> ProviderFuture<'a, VolumeRef>;

    /// Launches a machine without waiting for it to start.
    fn launch_machine<'a>(
        &'a self,
        app: &'a str,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, MachineHandle>;

    /// Lists every machine in the app.
    fn list_machines<'a>(&'a self, app: &'a str) -> ProviderFuture<'a, Vec<MachineHandle>>;

    /// Starts a machine.
    fn start_machine<'a>(&'a self, app: &'a str, machine_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Stops a machine.
    fn stop_machine<'a>(&'a self, app: &'a str, machine_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Force-destroys a machine.
    fn destroy_machine<'a>(&'a self, app: &'a str, machine_id: &'a str)
    -> ProviderFuture<'a, ()>;

    /// Deletes the app; an accepted (202) response counts as success.
    fn destroy_app<'a>(&'a self, app: &'a str) -> ProviderFuture<'a, ()>;

    /// Lists the app's machines and returns the one named exactly `name`.
    ///
    /// There is no direct lookup by name, so every call pays for a full list.
    fn find_machine_by_name<'a>(
        &'a self,
        app: &'a str,
        name: &'a str,
    ) -> ProviderFuture<'a, MachineHandle> {
        Box::pin(async move {
            self.list_machines(app)
                .await?
                .into_iter()
                .find(|machine| machine.name == name)
                .ok_or_else(|| ProviderError::NotFound {
                    name: name.to_owned(),
                })
        })
    }
}
