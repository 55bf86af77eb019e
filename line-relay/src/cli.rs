use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_CAPACITY, DeliveryMode, OverflowKind, RelayConfig, Topology};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay between one server and its clients.
    Broker(BrokerArgs),
    /// Send numbered requests through a broker and print what comes back.
    Client(ClientArgs),
    /// Consume relayed requests, optionally answering each one.
    Server(ServerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    #[arg(long, value_enum, default_value_t = Topology::OneWay)]
    pub topology: Topology,

    #[arg(long, value_enum, default_value_t = DeliveryMode::Sync)]
    pub mode: DeliveryMode,

    /// Maximum number of messages buffered per queue.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,

    #[arg(long, value_enum, default_value_t = OverflowKind::Strict)]
    pub policy: OverflowKind,

    /// Address the server connects to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5001")]
    pub server_listen: SocketAddr,

    /// Address clients connect to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub client_listen: SocketAddr,

    /// Number of clients to wait for. One-way relays always take one.
    #[arg(long, default_value_t = 1)]
    pub clients: usize,

    /// Read replies from the server connection and pass them back.
    #[arg(long)]
    pub server_replies: bool,

    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Pause used by the tolerant policy before retrying.
    #[arg(long)]
    pub cooldown_ms: Option<u64>,

    /// Minimum spacing between two sends to the server.
    #[arg(long)]
    pub send_interval_ms: Option<u64>,

    /// JSON relay configuration. Replaces every relay flag above.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl BrokerArgs {
    pub fn relay_config(&self) -> Result<RelayConfig> {
        if let Some(path) = &self.config {
            return RelayConfig::from_json_file(path);
        }

        let defaults = RelayConfig::default();
        let config = RelayConfig {
            topology: self.topology,
            mode: self.mode,
            capacity: self.capacity,
            overflow: self.policy,
            read_timeout_ms: self.read_timeout_ms.unwrap_or(defaults.read_timeout_ms),
            cooldown_ms: self.cooldown_ms.unwrap_or(defaults.cooldown_ms),
            send_interval_ms: self.send_interval_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Client connections to accept for the given topology.
    pub fn client_count(&self, topology: Topology) -> usize {
        match topology {
            Topology::OneWay => 1,
            Topology::MultiWay => self.clients,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Client-facing address of the broker.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub broker: SocketAddr,

    /// Name carried in every request.
    #[arg(long)]
    pub name: String,

    /// `sync` waits for each reply before sending the next request.
    #[arg(long, value_enum, default_value_t = DeliveryMode::Sync)]
    pub mode: DeliveryMode,

    /// Requests to send before closing.
    #[arg(long, default_value_t = 5)]
    pub count: u32,

    #[arg(long, default_value_t = 0)]
    pub interval_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Server-facing address of the broker.
    #[arg(long, default_value = "127.0.0.1:5001")]
    pub broker: SocketAddr,

    /// Answer every request with a numbered response.
    #[arg(long)]
    pub reply: bool,

    /// Delay before answering, to simulate work.
    #[arg(long, default_value_t = 0)]
    pub interval_ms: u64,
}
