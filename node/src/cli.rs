//! # CLI Interface
//!
//! Defines the command-line argument structure for `covenant-node` using
//! `clap` derive. Supports three subcommands: `run`, `init`, and `version`.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::LogFormat;

/// Covenant escrow node.
///
/// Serves the escrow engine over HTTP and WebSocket, settles payouts on an
/// in-memory ledger, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "covenant-node",
    about = "Covenant escrow node",
    version,
    propagate_version = true
)]
pub struct CovenantCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the covenant node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory and write a default `config.toml`.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand. Flags override the config file.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (TOML).
    ///
    /// When omitted, the node looks for `config.toml` in the data directory
    /// and falls back to built-in defaults if there is none.
    #[arg(long, short = 'c', env = "COVENANT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding `config.toml` and the `escrows.json` snapshot.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "COVENANT_DATA_DIR", default_value = ".covenant")]
    pub data_dir: PathBuf,

    /// Address for the REST/WebSocket API.
    #[arg(long, env = "COVENANT_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Address for the Prometheus metrics endpoint.
    #[arg(long, env = "COVENANT_METRICS_LISTEN")]
    pub metrics_listen: Option<SocketAddr>,

    /// Log output format.
    #[arg(long, value_enum, env = "COVENANT_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the data directory to initialize.
    #[arg(long, short = 'd', env = "COVENANT_DATA_DIR", default_value = ".covenant")]
    pub data_dir: PathBuf,

    /// Overwrite an existing `config.toml`.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        CovenantCli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = CovenantCli::try_parse_from([
            "covenant-node",
            "run",
            "--listen",
            "127.0.0.1:9000",
            "--log-format",
            "json",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.listen, Some("127.0.0.1:9000".parse().unwrap()));
                assert_eq!(args.log_format, Some(LogFormat::Json));
                assert!(args.metrics_listen.is_none());
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        assert!(CovenantCli::try_parse_from(["covenant-node", "run", "--listen", "nowhere"]).is_err());
    }
}
