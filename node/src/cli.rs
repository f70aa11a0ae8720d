//! # CLI Interface
//!
//! Defines the command-line argument structure for `skycast-node` using
//! `clap` derive. Subcommands: `run`, `init`, `regions` and `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Skycast broadcast queue node.
///
/// Runs the scheduler daemon that puts paid messages on the air in
/// descending bid-per-byte order, and serves a status API, an event
/// websocket and Prometheus metrics alongside it.
#[derive(Parser, Debug)]
#[command(
    name = "skycast-node",
    about = "Skycast pay-per-byte broadcast queue node",
    version,
    propagate_version = true
)]
pub struct SkycastCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the skycast node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the scheduler daemon and the status API.
    Run(RunArgs),
    /// Initialize a data directory and generate a fresh server secret.
    Init(InitArgs),
    /// Inspect or edit the region registry.
    Regions(RegionsArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Data directory holding the database, message payloads and the
    /// scheduler lock. Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "SKYCAST_DATA_DIR", default_value = "./skycast-data")]
    pub data_dir: PathBuf,

    /// Port for the status API and event websocket.
    #[arg(long, env = "SKYCAST_API_PORT", default_value_t = 9292)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "SKYCAST_METRICS_PORT", default_value_t = 9293)]
    pub metrics_port: u16,

    /// Channel capacity in bytes per second.
    #[arg(
        long,
        env = "SKYCAST_TRANSMIT_RATE",
        default_value_t = skycast_protocol::config::DEFAULT_TRANSMIT_RATE,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub transmit_rate: u64,

    /// Minimum price per over-the-air byte, in millisatoshis.
    #[arg(long, env = "SKYCAST_MIN_PER_BYTE_BID", default_value_t = skycast_protocol::config::MIN_PER_BYTE_BID)]
    pub min_per_byte_bid: u64,

    /// Minimum bid for a new order, in millisatoshis.
    #[arg(long, env = "SKYCAST_MIN_BID", default_value_t = skycast_protocol::config::MIN_BID)]
    pub min_bid: u64,

    /// Seconds between reclamation passes.
    #[arg(long, env = "SKYCAST_DUTY_CYCLE_SECS", default_value_t = 300)]
    pub duty_cycle_secs: u64,

    /// Milliseconds between dequeue polls when the queue is empty.
    #[arg(long, env = "SKYCAST_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Hours an unpaid order may stay pending.
    #[arg(long, env = "SKYCAST_PENDING_ORDER_TTL_HOURS", default_value_t = 24)]
    pub pending_order_ttl_hours: u64,

    /// Days a transmitted payload is retained.
    #[arg(long, env = "SKYCAST_RETENTION_DAYS", default_value_t = 31)]
    pub retention_days: u64,

    /// Root URL payment webhooks are sent to.
    #[arg(long, env = "SKYCAST_CALLBACK_ROOT", default_value = skycast_protocol::config::DEFAULT_CALLBACK_ROOT)]
    pub callback_root: String,

    /// Hex-encoded server secret used to derive webhook and order tokens.
    ///
    /// If not provided, the node reads `server.secret` from the data
    /// directory. Prefer the file; flags end up in shell history.
    #[arg(long, env = "SKYCAST_SERVER_SECRET", hide_env_values = true)]
    pub server_secret: Option<String>,

    /// Log output format.
    #[arg(long, env = "SKYCAST_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "SKYCAST_DATA_DIR", default_value = "./skycast-data")]
    pub data_dir: PathBuf,

    /// Replace an existing server secret. Outstanding tokens stop verifying.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `regions` subcommand.
#[derive(Parser, Debug)]
pub struct RegionsArgs {
    /// Data directory holding the database.
    #[arg(long, short = 'd', env = "SKYCAST_DATA_DIR", default_value = "./skycast-data")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub action: RegionAction,
}

#[derive(Subcommand, Debug)]
pub enum RegionAction {
    /// List every region and whether it has a monitoring receiver.
    List,
    /// Record whether a region has a monitoring receiver.
    ///
    /// Takes effect for quorum checks the next time the node starts.
    SetReceiver {
        /// Region number.
        number: u8,
        /// Receiver presence.
        #[arg(value_enum)]
        presence: Presence,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Presence {
    On,
    Off,
}

impl Presence {
    pub fn as_bool(self) -> bool {
        self == Presence::On
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        SkycastCli::command().debug_assert();
    }

    #[test]
    fn run_defaults_match_protocol_constants() {
        let cli = SkycastCli::parse_from(["skycast-node", "run"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.transmit_rate, skycast_protocol::config::DEFAULT_TRANSMIT_RATE);
        assert_eq!(args.min_bid, skycast_protocol::config::MIN_BID);
        assert_eq!(args.log_format, LogFormat::Pretty);
    }

    #[test]
    fn zero_transmit_rate_is_rejected() {
        let parsed = SkycastCli::try_parse_from(["skycast-node", "run", "--transmit-rate", "0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn set_receiver_parses() {
        let cli = SkycastCli::parse_from(["skycast-node", "regions", "set-receiver", "2", "on"]);
        let Commands::Regions(args) = cli.command else {
            panic!("expected regions");
        };
        assert!(matches!(
            args.action,
            RegionAction::SetReceiver { number: 2, presence: Presence::On }
        ));
    }
}
