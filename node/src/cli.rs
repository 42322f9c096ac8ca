//! # CLI Interface
//!
//! Command-line arguments for `marketpulse-node`, via `clap` derive. Every
//! `run` flag can also be set from a `MARKETPULSE_*` environment variable.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// MarketPulse vault node.
///
/// Hosts the vault registry, serves the HTTP/WS API, runs the vault manager
/// loop and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "marketpulse-node",
    about = "MarketPulse event-vault node",
    version,
    propagate_version = true
)]
pub struct MarketPulseCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Write a default configuration file.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to a JSON configuration file.
    ///
    /// When omitted, built-in defaults are used.
    #[arg(long, short = 'c', env = "MARKETPULSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the vault database. Created on first run.
    #[arg(
        long,
        short = 'd',
        env = "MARKETPULSE_DATA_DIR",
        default_value = "./marketpulse-data"
    )]
    pub data_dir: PathBuf,

    /// Keep all state in memory and discard it on shutdown.
    #[arg(long, env = "MARKETPULSE_EPHEMERAL")]
    pub ephemeral: bool,

    /// Port for the REST and WebSocket API.
    #[arg(long, env = "MARKETPULSE_API_PORT", default_value_t = 7410)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "MARKETPULSE_METRICS_PORT", default_value_t = 7411)]
    pub metrics_port: u16,

    /// Log output format. Overrides `logging.format` from the config file.
    #[arg(long, env = "MARKETPULSE_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,

    /// Overrides the operator account from the configuration file.
    #[arg(long, env = "MARKETPULSE_OPERATOR")]
    pub operator: Option<String>,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Where to write the configuration file.
    #[arg(long, short = 'o', default_value = "marketpulse.json")]
    pub output: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        MarketPulseCli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = MarketPulseCli::try_parse_from(["marketpulse-node", "run", "--ephemeral"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert!(args.ephemeral);
                assert_eq!(args.api_port, 7410);
                assert_eq!(args.metrics_port, 7411);
                assert_eq!(args.log_format, None);
                assert!(args.config.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn json_log_format_flag() {
        let cli =
            MarketPulseCli::try_parse_from(["marketpulse-node", "run", "--log-format", "json"])
                .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.log_format, Some(LogFormat::Json));
    }
}
