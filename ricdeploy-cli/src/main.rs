//! `ricdeploy` command line.
//!
//! Exit codes: 0 on success, 1 when a pipeline halts or a port cannot be
//! reclaimed, 2 on configuration errors.

mod commands;

use clap::{Args, Parser, Subcommand};
use ricdeploy::checksum::DigestAlgorithm;
use ricdeploy::errors::DeployError;
use ricdeploy::observability::LogFormat;
use std::path::PathBuf;
use std::process::ExitCode;

/// Default configuration file looked up in the working directory.
const DEFAULT_CONFIG: &str = "ricdeploy.toml";

/// Exit code for configuration errors.
const EXIT_CONFIG: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "ricdeploy")]
#[command(author, version, about = "Idempotent xApp deployment for a near-RT RIC")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Configuration file (defaults to ./ricdeploy.toml when present)
    #[arg(long, short, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Never prompt; every confirmation is answered "no"
    #[arg(long, global = true, conflicts_with = "assume_yes")]
    non_interactive: bool,

    /// Never prompt; every confirmation is answered "yes"
    #[arg(long, short = 'y', global = true)]
    assume_yes: bool,

    /// Skip the effective-uid check
    #[arg(long, global = true)]
    allow_non_root: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Log output format (text or json)
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the deployment pipeline
    Deploy {
        /// Write the pipeline report as JSON
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,

        /// Do not start the log session after a successful deployment
        #[arg(long)]
        skip_logs: bool,
    },
    /// Remove the workload and release its ports
    Undeploy {
        /// Write the pipeline report as JSON
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,
    },
    /// Show workload, registry and port status
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Free TCP ports held by stale processes
    Reclaim {
        /// Ports to free, in order
        #[arg(required = true, value_name = "PORT")]
        ports: Vec<u16>,
    },
    /// Compare two files by digest
    Verify {
        /// Source file
        source: PathBuf,
        /// Copy to check
        dest: PathBuf,
        /// Digest algorithm (sha256 or md5)
        #[arg(long, default_value = "sha256")]
        algorithm: DigestAlgorithm,
    },
    /// Create a container network unless it exists
    EnsureNetwork {
        /// Network name
        name: String,
        /// Network driver
        #[arg(long)]
        driver: Option<String>,
    },
    /// Port-forward and follow the workload logs until Ctrl-C
    Logs,
}

impl Commands {
    fn needs_root(&self) -> bool {
        matches!(
            self,
            Self::Deploy { .. } | Self::Undeploy { .. } | Self::Reclaim { .. }
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = ricdeploy::observability::init_tracing(&cli.global.log_level, cli.global.log_format) {
        eprintln!("error: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_status_for(&err))
        }
    }
}

fn exit_status_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<DeployError>() {
        Some(DeployError::Config(_)) => EXIT_CONFIG,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if cli.command.needs_root() && !cli.global.allow_non_root && !nix::unistd::geteuid().is_root() {
        return Err(DeployError::precondition(
            "this command must run as root (use --allow-non-root to override)",
        )
        .into());
    }

    let global = &cli.global;
    match cli.command {
        Commands::Deploy { report, skip_logs } => {
            commands::deploy(global, report.as_deref(), skip_logs).await
        }
        Commands::Undeploy { report } => commands::undeploy(global, report.as_deref()).await,
        Commands::Status { json } => commands::status(global, json).await,
        Commands::Reclaim { ports } => commands::reclaim(global, &ports).await,
        Commands::Verify {
            source,
            dest,
            algorithm,
        } => Ok(commands::verify(&source, &dest, algorithm).await),
        Commands::EnsureNetwork { name, driver } => commands::ensure_network(&name, driver).await,
        Commands::Logs => commands::logs(global).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_deploy_with_globals() {
        let cli = Cli::parse_from([
            "ricdeploy",
            "--config",
            "deploy.toml",
            "--assume-yes",
            "--log-format",
            "json",
            "deploy",
            "--skip-logs",
        ]);
        assert_eq!(cli.global.config, Some(PathBuf::from("deploy.toml")));
        assert!(cli.global.assume_yes);
        assert_eq!(cli.global.log_format, LogFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Deploy {
                report: None,
                skip_logs: true
            }
        ));
        assert!(cli.command.needs_root());
    }

    #[test]
    fn test_prompt_flags_conflict() {
        let parsed = Cli::try_parse_from(["ricdeploy", "--assume-yes", "--non-interactive", "status"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_reclaim_requires_ports() {
        assert!(Cli::try_parse_from(["ricdeploy", "reclaim"]).is_err());
        let cli = Cli::try_parse_from(["ricdeploy", "reclaim", "8086", "8090"]).unwrap();
        assert!(matches!(cli.command, Commands::Reclaim { ref ports } if ports == &[8086, 8090]));
    }

    #[test]
    fn test_verify_algorithm() {
        let cli = Cli::parse_from(["ricdeploy", "verify", "a.json", "b.json", "--algorithm", "md5"]);
        assert!(matches!(
            cli.command,
            Commands::Verify {
                algorithm: DigestAlgorithm::Md5,
                ..
            }
        ));
        assert!(!cli.command.needs_root());
    }

    #[test]
    fn test_config_error_exit_code() {
        let err = anyhow::Error::from(DeployError::config("bad"));
        assert_eq!(exit_status_for(&err), EXIT_CONFIG);
        let err = anyhow::Error::from(DeployError::config("bad")).context("loading ricdeploy.toml");
        assert_eq!(exit_status_for(&err), EXIT_CONFIG);
        let err = anyhow::Error::from(DeployError::precondition("not root"));
        assert_eq!(exit_status_for(&err), 1);
    }
}
