//! # CLI Interface
//!
//! Command-line arguments for `dedi-gateway`, via `clap` derive. Four
//! subcommands: `run`, `init`, `status` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Decentralised discovery gateway node.
///
/// Admits peers into private networks behind a proof-of-work gate, keeps
/// sessions to them, and proxies discovery requests to the best-scoring
/// peer.
#[derive(Parser, Debug)]
#[command(
    name = "dedi-gateway",
    about = "Decentralised discovery gateway node",
    version,
    propagate_version = true
)]
pub struct DediGatewayCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway.
    Run(RunArgs),
    /// Create a data directory with a node key and a starter config.
    Init(InitArgs),
    /// Query the status of a running gateway.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for `run`. Flags override values from the config file.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the gateway configuration file (TOML).
    ///
    /// When omitted, `config.toml` in the data directory is used if present.
    #[arg(long, short = 'c', env = "DEDI_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory holding the node key and the peer database.
    #[arg(long, short = 'd', env = "DEDI_DATA_DIR", default_value = ".dedi")]
    pub data_dir: PathBuf,

    /// Address the HTTP surface binds to.
    #[arg(long, env = "DEDI_LISTEN", default_value = dedi_protocol::config::DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// Public base URL peers use to reach this node.
    #[arg(long, env = "DEDI_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Human-friendly node name for logs and status output.
    #[arg(long, env = "DEDI_NODE_NAME")]
    pub node_name: Option<String>,

    /// Default admission difficulty for networks created here.
    #[arg(long, env = "DEDI_DIFFICULTY")]
    pub difficulty: Option<u32>,

    /// Keep everything in memory instead of the data directory.
    #[arg(long)]
    pub ephemeral: bool,

    /// Log output format.
    #[arg(long, value_enum, env = "DEDI_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "DEDI_DATA_DIR", default_value = ".dedi")]
    pub data_dir: PathBuf,

    /// Public base URL to write into the starter config.
    #[arg(long, default_value = "http://127.0.0.1:8720")]
    pub endpoint: String,

    /// Overwrite an existing node key.
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Base URL of the running gateway.
    #[arg(long, default_value = "http://127.0.0.1:8720")]
    pub url: String,
}
