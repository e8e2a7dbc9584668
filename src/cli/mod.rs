//! Command-line interface definitions for the `fly-provider` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `fly-provider` binary.
#[derive(Debug, Parser)]
#[command(
    name = "fly-provider",
    about = "Provision and manage remote development machines reached over a mesh network",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create the machine, wait for it and connect to its agent.
    #[command(name = "create", about = "Create a target machine and wait until its agent answers")]
    Create(CreateArgs),
    /// Start a stopped machine.
    #[command(name = "start", about = "Start a stopped target machine")]
    Start(TargetArgs),
    /// Stop a running machine.
    #[command(name = "stop", about = "Stop a running target machine")]
    Stop(TargetArgs),
    /// Destroy the machine and its app.
    #[command(name = "destroy", about = "Destroy a target machine and its app")]
    Destroy(TargetArgs),
    /// Print machine metadata as JSON.
    #[command(name = "metadata", about = "Print target metadata as JSON")]
    Metadata(TargetArgs),
    /// Follow a machine's logs.
    #[command(name = "logs", about = "Stream target machine logs to stdout")]
    Logs(LogsArgs),
    /// Print provider identity and accepted options as JSON.
    #[command(name = "info", about = "Print provider information as JSON")]
    Info,
}

/// Identifies a target and carries its per-target options.
#[derive(Debug, Args)]
pub(crate) struct TargetArgs {
    /// Target identifier; names the app and is the machine's mesh host name.
    #[arg(long, value_name = "ID")]
    pub(crate) target_id: String,
    /// Target name; names the machine and its volume.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: String,
    /// Target options as JSON (`Region`, `Size`, `Disk Size`, `Org Slug`,
    /// `Auth Token`).
    #[arg(long, value_name = "JSON", default_value = "{}")]
    pub(crate) options: String,
    /// Remote user; the volume is mounted at its home directory.
    #[arg(long, value_name = "USER", default_value = "daytona")]
    pub(crate) user: String,
    /// Key the machine uses to download the agent.
    #[arg(
        long,
        value_name = "KEY",
        env = "FLY_PROVIDER_AGENT_API_KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub(crate) api_key: String,
    /// Environment variable for the machine, as `KEY=VALUE`. Repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub(crate) env: Vec<String>,
}

/// Arguments for the `fly-provider create` subcommand.
#[derive(Debug, Args)]
pub(crate) struct CreateArgs {
    /// Target to create.
    #[command(flatten)]
    pub(crate) target: TargetArgs,
    /// Image the machine runs.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: String,
}

/// Arguments for the `fly-provider logs` subcommand.
#[derive(Debug, Args)]
pub(crate) struct LogsArgs {
    /// Target to stream logs for.
    #[command(flatten)]
    pub(crate) target: TargetArgs,
    /// Restrict output to one machine; empty streams the whole app.
    #[arg(long, value_name = "MACHINE_ID", default_value = "")]
    pub(crate) machine_id: String,
}
