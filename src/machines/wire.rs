//! JSON payloads exchanged with the Machines API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LaunchSpec, MachineHandle, MachineMount, MachineState, VolumeRequest};

#[derive(Serialize)]
pub(super) struct CreateAppRequest<'a> {
    pub app_name: &'a str,
    pub org_slug: &'a str,
}

#[derive(Serialize)]
pub(super) struct CreateVolumeRequest<'a> {
    pub name: &'a str,
    pub size_gb: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub region: &'a str,
}

impl<'a> From<&'a VolumeRequest> for CreateVolumeRequest<'a> {
    fn from(request: &'a VolumeRequest) -> Self {
        Self {
            name: &request.name,
            size_gb: request.size_gb,
            region: &request.region,
        }
    }
}

#[derive(Deserialize)]
pub(super) struct VolumeResponse {
    pub id: String,
    pub name: String,
}

#[derive(Serialize)]
pub(super) struct LaunchMachineRequest<'a> {
    pub name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub region: &'a str,
    pub config: MachineConfig<'a>,
}

#[derive(Serialize)]
pub(super) struct MachineConfig<'a> {
    pub image: &'a str,
    pub size: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<InitPayload<'a>>,
}

#[derive(Serialize)]
pub(super) struct InitPayload<'a> {
    pub entrypoint: &'a [String],
}

impl<'a> From<&'a LaunchSpec> for LaunchMachineRequest<'a> {
    fn from(spec: &'a LaunchSpec) -> Self {
        Self {
            name: &spec.name,
            region: &spec.region,
            config: MachineConfig {
                image: &spec.image,
                size: &spec.size,
                env: &spec.env,
                mounts: spec.mounts.iter().map(MountPayload::from).collect(),
                init: (!spec.entrypoint.is_empty()).then_some(InitPayload {
                    entrypoint: &spec.entrypoint,
                }),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub(super) struct MountPayload {
    #[serde(default)]
    pub volume: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size_gb: u32,
}

impl From<&MachineMount> for MountPayload {
    fn from(mount: &MachineMount) -> Self {
        Self {
            volume: mount.volume.clone(),
            name: mount.name.clone(),
            path: mount.path.clone(),
            size_gb: mount.size_gb,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct MachineResponse {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub state: MachineState,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: Option<MachineConfigResponse>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct MachineConfigResponse {
    #[serde(default)]
    pub mounts: Vec<MountPayload>,
}

impl From<MachineResponse> for MachineHandle {
    fn from(response: MachineResponse) -> Self {
        let mounts = response
            .config
            .map(|config| config.mounts)
            .unwrap_or_default()
            .into_iter()
            .map(|mount| MachineMount {
                volume: mount.volume,
                name: mount.name,
                path: mount.path,
                size_gb: mount.size_gb,
            })
            .collect();
        Self {
            id: response.id,
            name: response.name,
            state: response.state,
            region: response.region,
            created_at: response.created_at,
            mounts,
        }
    }
}
