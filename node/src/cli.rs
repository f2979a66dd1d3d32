//! # CLI Interface
//!
//! Defines the command-line argument structure for `relaynet-node` using
//! `clap` derive. Supports three subcommands: `run`, `scenario`, and
//! `version`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};

use relaynet_transport::config::{
    NetworkMode, DEFAULT_LISTEN_PORT, DEFAULT_MAX_ATTEMPTS, DEFAULT_METRICS_PORT,
};
use relaynet_transport::PeerAddress;

use crate::logging::LogFormat;

/// relaynet messaging node.
///
/// Carries payment-channel messages between peers over UDP, over a
/// Matrix-style chat homeserver, or over both with automatic failover.
/// Exposes Prometheus metrics and a peer health listing over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "relaynet-node",
    about = "relaynet messaging node",
    version,
    propagate_version = true
)]
pub struct RelaynetCli {
    /// Log output format.
    #[arg(long, global = true, env = "RELAYNET_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node and serve until SIGINT/SIGTERM.
    Run(RunArgs),
    /// Run the built-in end-to-end checks against in-memory networks.
    Scenario(ScenarioArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// This node's 20-byte address, hex encoded (`0x` prefix optional).
    #[arg(long, env = "RELAYNET_ADDRESS")]
    pub address: PeerAddress,

    /// Which transports to run: no-network, udp-only, chat-only, mixed.
    #[arg(long, env = "RELAYNET_MODE", default_value = "mixed")]
    pub mode: NetworkMode,

    /// Mobile device. Forces the mixed mode regardless of `--mode`.
    #[arg(long, env = "RELAYNET_MOBILE")]
    pub mobile: bool,

    /// UDP port for the datagram transport.
    #[arg(long, env = "RELAYNET_LISTEN_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Port for the `/metrics` and `/peers` endpoints.
    #[arg(long, env = "RELAYNET_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Known peer as `<address>@<host:port>`. Repeatable.
    #[arg(long = "peer", env = "RELAYNET_PEERS", value_delimiter = ',')]
    pub peers: Vec<PeerSpec>,

    /// Transmissions per datagram message before it is reported failed.
    #[arg(long, env = "RELAYNET_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Seconds between health probe rounds. 0 disables probing.
    #[arg(long, env = "RELAYNET_PROBE_INTERVAL", default_value_t = 15)]
    pub probe_interval_secs: u64,

    #[command(flatten)]
    pub chat: ChatArgs,
}

/// Homeserver connection settings. Required by the chat-only and mixed
/// modes.
#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// Homeserver base URL, e.g. `https://chat.example.org`.
    #[arg(long, env = "RELAYNET_HOMESERVER")]
    pub homeserver: Option<String>,

    /// Server name used in user ids and room aliases.
    #[arg(long, env = "RELAYNET_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Access token for this node's homeserver account.
    #[arg(long, env = "RELAYNET_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Directory for the persisted room state.
    #[arg(long, env = "RELAYNET_STORE_DIR", default_value = "relaynet-rooms")]
    pub store_dir: PathBuf,
}

/// Arguments for the `scenario` subcommand.
#[derive(Args, Debug)]
pub struct ScenarioArgs {
    /// Run every registered scenario.
    #[arg(long, conflicts_with = "name")]
    pub all: bool,

    /// Run a single scenario by name.
    #[arg(long)]
    pub name: Option<String>,

    /// List registered scenario names and exit.
    #[arg(long)]
    pub list: bool,
}

/// `<address>@<host:port>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub address: PeerAddress,
    pub endpoint: SocketAddr,
}

impl FromStr for PeerSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, endpoint) = s
            .split_once('@')
            .ok_or_else(|| format!("expected <address>@<host:port>, got {s:?}"))?;
        Ok(Self {
            address: address.parse().map_err(|e| format!("{e}"))?,
            endpoint: endpoint
                .parse()
                .map_err(|e| format!("bad endpoint {endpoint:?}: {e}"))?,
        })
    }
}
