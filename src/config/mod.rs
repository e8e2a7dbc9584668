//! Configuration loading via `ortho-config` plus per-target option parsing.
//!
//! [`ProviderConfig`] holds the process-level settings (mesh network
//! credentials, local paths, tool binaries) and is merged from defaults,
//! `fly-provider.toml` and `FLY_PROVIDER_*` environment variables.
//! [`TargetOptions`] are parsed from the JSON document attached to each
//! target request.

mod target;

use std::str::FromStr;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

pub use target::{
    AUTH_TOKEN_ENV, DEFAULT_DISK_SIZE_GB, DEFAULT_MACHINE_SIZE, OptionKind, REGIONS,
    TargetConfigProperty, TargetOptions, target_config_manifest,
};

/// Default base URL of the Machines API.
pub const DEFAULT_API_BASE_URL: &str = "https://api.machines.dev/v1";

/// Default base URL of the platform API serving application logs.
pub const DEFAULT_LOGS_BASE_URL: &str = "https://api.fly.io";

/// Default port the remote agent exposes its SSH server on.
pub const DEFAULT_AGENT_SSH_PORT: u16 = 2222;

/// Default TCP port of the remote container daemon in direct-dial mode.
pub const DEFAULT_DAEMON_PORT: u16 = 2375;

/// Default path of the container daemon socket on the remote machine.
pub const DEFAULT_REMOTE_SOCKET: &str = "/var/run/docker.sock";

/// How remote daemon traffic reaches the machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TunnelMode {
    /// Keep a persistent SSH forward of the remote Unix socket to a local one.
    Forward,
    /// Dial the daemon's TCP port over the mesh session for every connection.
    Direct,
}

impl FromStr for TunnelMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Self::Forward),
            "direct" => Ok(Self::Direct),
            other => Err(ConfigError::InvalidValue {
                field: String::from("tunnel_mode"),
                message: format!("expected \"forward\" or \"direct\", got \"{other}\""),
            }),
        }
    }
}

/// Process-level provider configuration derived from environment variables
/// and configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLY_PROVIDER",
    discovery(
        app_name = "fly-provider",
        env_var = "FLY_PROVIDER_CONFIG_PATH",
        config_file_name = "fly-provider.toml",
        dotfile_name = ".fly-provider.toml",
        project_file_name = "fly-provider.toml"
    )
)]
pub struct ProviderConfig {
    /// Base working directory; each mesh session gets a unique subdirectory.
    #[ortho_config(default = "/tmp/fly-provider".to_owned())]
    pub base_path: String,
    /// Pre-shared key used to join the mesh network. Required.
    pub network_key: String,
    /// URL of the mesh network's control server. Required.
    pub control_url: String,
    /// Directory holding one forwarded daemon socket per machine.
    #[ortho_config(default = "/tmp/fly-provider/sockets".to_owned())]
    pub local_sock_dir: String,
    /// Either `forward` (persistent socket forward) or `direct` (dial per call).
    #[ortho_config(default = "forward".to_owned())]
    pub tunnel_mode: String,
    /// URL of the agent installer fetched by the machine's init script.
    #[ortho_config(default = "https://download.daytona.io/daytona/install.sh".to_owned())]
    pub agent_download_url: String,
    /// Base URL of the Machines API.
    #[ortho_config(default = DEFAULT_API_BASE_URL.to_owned())]
    pub api_base_url: String,
    /// Base URL of the platform API serving logs.
    #[ortho_config(default = DEFAULT_LOGS_BASE_URL.to_owned())]
    pub logs_base_url: String,
    /// Path to the `ssh` executable used for socket forwarding.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user for the agent's SSH server.
    #[ortho_config(default = "daytona".to_owned())]
    pub ssh_user: String,
    /// Port of the agent's SSH server.
    #[ortho_config(default = DEFAULT_AGENT_SSH_PORT)]
    pub ssh_port: u16,
    /// TCP port of the remote daemon used in direct-dial mode.
    #[ortho_config(default = DEFAULT_DAEMON_PORT)]
    pub daemon_port: u16,
    /// Remote daemon socket forwarded in persistent-forward mode.
    #[ortho_config(default = DEFAULT_REMOTE_SOCKET.to_owned())]
    pub remote_socket: String,
    /// Path to the `tailscaled` executable hosting the mesh session.
    #[ortho_config(default = "tailscaled".to_owned())]
    pub tailscaled_bin: String,
    /// Path to the `tailscale` CLI used to log the session in.
    #[ortho_config(default = "tailscale".to_owned())]
    pub tailscale_bin: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl ProviderConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to fly-provider.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("fly-provider")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the configured [`TunnelMode`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for anything other than
    /// `forward` or `direct`.
    pub fn tunnel_mode(&self) -> Result<TunnelMode, ConfigError> {
        self.tunnel_mode.parse()
    }

    /// Base working directory as a UTF-8 path.
    #[must_use]
    pub fn base_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.base_path)
    }

    /// Directory holding forwarded sockets as a UTF-8 path.
    #[must_use]
    pub fn local_sock_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.local_sock_dir)
    }

    /// Performs semantic validation on required fields. Error messages name
    /// the environment variable and TOML key that supply the value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty,
    /// or [`ConfigError::InvalidValue`] for an unknown tunnel mode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.network_key,
                FieldMetadata::new(
                    "mesh network key",
                    "FLY_PROVIDER_NETWORK_KEY",
                    "network_key",
                ),
            ),
            (
                &self.control_url,
                FieldMetadata::new(
                    "mesh control server URL",
                    "FLY_PROVIDER_CONTROL_URL",
                    "control_url",
                ),
            ),
            (
                &self.base_path,
                FieldMetadata::new("base path", "FLY_PROVIDER_BASE_PATH", "base_path"),
            ),
            (
                &self.local_sock_dir,
                FieldMetadata::new(
                    "local socket directory",
                    "FLY_PROVIDER_LOCAL_SOCK_DIR",
                    "local_sock_dir",
                ),
            ),
            (
                &self.api_base_url,
                FieldMetadata::new(
                    "Machines API URL",
                    "FLY_PROVIDER_API_BASE_URL",
                    "api_base_url",
                ),
            ),
            (
                &self.logs_base_url,
                FieldMetadata::new(
                    "logs API URL",
                    "FLY_PROVIDER_LOGS_BASE_URL",
                    "logs_base_url",
                ),
            ),
            (
                &self.ssh_bin,
                FieldMetadata::new("ssh executable", "FLY_PROVIDER_SSH_BIN", "ssh_bin"),
            ),
            (
                &self.ssh_user,
                FieldMetadata::new("agent SSH user", "FLY_PROVIDER_SSH_USER", "ssh_user"),
            ),
            (
                &self.remote_socket,
                FieldMetadata::new(
                    "remote daemon socket",
                    "FLY_PROVIDER_REMOTE_SOCKET",
                    "remote_socket",
                ),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }
        self.tunnel_mode()?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value outside its accepted set.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Description of the accepted values.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader or the JSON decoder.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}
