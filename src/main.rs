//! Binary entry point for the `fly-provider` CLI.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process;

use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use fly_provider::{
    FlyProvider, LogSink, ProviderConfig, ProviderError, ProviderInfo, TargetMetadata,
    TargetRequest,
};

mod cli;

use cli::{Cli, CreateArgs, LogsArgs, TargetArgs};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

/// Where per-target progress text is written.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SinkTarget {
    Stdout,
    Stderr,
}

impl SinkTarget {
    /// Streamed logs are the output of `logs`; everywhere else progress text
    /// must stay out of the JSON written to stdout.
    const fn for_command(cli: &Cli) -> Self {
        match cli {
            Cli::Logs(_) => Self::Stdout,
            _ => Self::Stderr,
        }
    }

    fn into_sink(self) -> LogSink {
        match self {
            Self::Stdout => LogSink::stdout(),
            Self::Stderr => LogSink::stderr(),
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let sink = SinkTarget::for_command(&cli).into_sink();
    match cli {
        Cli::Info => write_json(io::stdout(), &ProviderInfo::current()),
        Cli::Create(CreateArgs { target, image }) => {
            let request = TargetRequest {
                image,
                ..target_request(target)?
            };
            let created = load_provider()?.create_target(&request, &sink).await?;
            write_json(io::stdout(), &TargetMetadata::from(&created.machine))
        }
        Cli::Start(args) => {
            let request = target_request(args)?;
            Ok(load_provider()?.start_target(&request, &sink).await?)
        }
        Cli::Stop(args) => {
            let request = target_request(args)?;
            Ok(load_provider()?.stop_target(&request, &sink).await?)
        }
        Cli::Destroy(args) => {
            let request = target_request(args)?;
            Ok(load_provider()?.destroy_target(&request, &sink).await?)
        }
        Cli::Metadata(args) => {
            let request = target_request(args)?;
            let metadata = load_provider()?.target_metadata(&request, &sink).await?;
            write_json(io::stdout(), &metadata)
        }
        Cli::Logs(LogsArgs { target, machine_id }) => {
            let request = target_request(target)?;
            match load_provider()?
                .stream_logs(&request, &machine_id, &sink)
                .await
            {
                Ok(never) => match never {},
                Err(err) => Err(err.into()),
            }
        }
    }
}

fn load_provider() -> Result<FlyProvider, CliError> {
    let config =
        ProviderConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    Ok(FlyProvider::from_config(&config)?)
}

fn target_request(args: TargetArgs) -> Result<TargetRequest, CliError> {
    Ok(TargetRequest {
        env: parse_env_pairs(&args.env)?,
        id: args.target_id,
        name: args.name,
        image: String::new(),
        user: args.user,
        api_key: args.api_key,
        options: args.options,
    })
}

fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .ok_or_else(|| {
                    CliError::InvalidArgument(format!("expected KEY=VALUE, got \"{pair}\""))
                })
        })
        .collect()
}

fn write_json(mut target: impl Write, value: &impl Serialize) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(target, "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn parse_env_pairs_splits_on_first_equals() {
        let env = parse_env_pairs(&[String::from("A=1"), String::from("B=x=y")])
            .expect("pairs should parse");
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("x=y"));
    }

    #[rstest]
    #[case("NOVALUE")]
    #[case("=value")]
    fn parse_env_pairs_rejects_malformed_entries(#[case] pair: &str) {
        let err = parse_env_pairs(&[pair.to_owned()]).expect_err("pair should be rejected");
        assert!(matches!(err, CliError::InvalidArgument(_)), "unexpected: {err}");
    }

    #[rstest]
    fn cli_parses_target_arguments() {
        let cli = Cli::try_parse_from([
            "fly-provider",
            "create",
            "--target-id",
            "t1",
            "--name",
            "ws",
            "--image",
            "alpine:3",
            "--env",
            "EDITOR=vi",
        ])
        .expect("arguments should parse");
        let Cli::Create(args) = cli else {
            panic!("expected create");
        };
        assert_eq!(args.image, "alpine:3");
        let request = target_request(args.target).expect("request");
        assert_eq!(request.id, "t1");
        assert_eq!(request.user, "daytona");
        assert_eq!(request.options, "{}");
        assert_eq!(request.env.get("EDITOR").map(String::as_str), Some("vi"));
    }

    #[rstest]
    fn create_requires_an_image() {
        let err =
            Cli::try_parse_from(["fly-provider", "create", "--target-id", "t1", "--name", "ws"])
                .expect_err("image is required");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[rstest]
    #[case(&["fly-provider", "info"], SinkTarget::Stderr)]
    #[case(&["fly-provider", "stop", "--target-id", "t1", "--name", "ws"], SinkTarget::Stderr)]
    #[case(
        &["fly-provider", "create", "--target-id", "t1", "--name", "ws", "--image", "alpine:3"],
        SinkTarget::Stderr
    )]
    #[case(&["fly-provider", "logs", "--target-id", "t1", "--name", "ws"], SinkTarget::Stdout)]
    fn progress_text_stays_off_json_output(#[case] argv: &[&str], #[case] expected: SinkTarget) {
        let cli = Cli::try_parse_from(argv).expect("arguments should parse");
        assert_eq!(SinkTarget::for_command(&cli), expected);
    }

    #[rstest]
    fn write_json_renders_provider_info() {
        let mut buf = Vec::new();
        write_json(&mut buf, &ProviderInfo::current()).expect("write");
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(rendered.contains("\"name\": \"fly-provider\""), "rendered: {rendered}");
        assert!(rendered.ends_with('\n'));
    }

    #[rstest]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::Config(String::from("missing key")));
        let rendered = String::from_utf8(buf).expect("utf8");
        assert_eq!(rendered, "configuration error: missing key\n");
    }
}
