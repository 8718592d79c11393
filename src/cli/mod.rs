use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::{BridgeConfig, DEFAULT_LISTEN_PORT};

pub mod handler;
pub mod ui;

pub use handler::handle_command;

#[derive(Parser, Debug)]
#[command(author, version, about = "Play LAN games with friends over the internet", long_about = None)]
pub struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Redraw a live status table instead of logging status changes
    #[arg(long, global = true)]
    pub watch: bool,

    #[command(flatten)]
    pub tuning: Tuning,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Host the game running on this machine
    Host {
        /// Port the game server listens on locally
        #[arg(long)]
        game_port: u16,
        /// Where joining peers connect
        #[arg(long, default_value = "0.0.0.0:27960")]
        peer_listen: SocketAddr,
        /// Name shown to other players
        #[arg(long, default_value = "host")]
        name: String,
        /// Only admit these players (anyone may join when omitted)
        #[arg(long = "allow", value_name = "NAME")]
        allow: Vec<String>,
    },
    /// Join a game hosted elsewhere
    Join {
        /// Host address as ip:port
        host: String,
        /// Local port the game client should connect to
        #[arg(long, default_value_t = DEFAULT_LISTEN_PORT)]
        listen_port: u16,
        /// Name shown to other players
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct Tuning {
    /// Largest message handed to the transport
    #[arg(long, default_value_t = 64 * 1024)]
    pub chunk_size: usize,
    /// Unwritten bytes per local connection before reading from the peer pauses
    #[arg(long, default_value_t = 1024 * 1024)]
    pub backlog_threshold: usize,
    /// Seconds both halves of a pairing get to come up
    #[arg(long, default_value_t = 10)]
    pub join_timeout: u64,
    /// Seconds a closing connection may spend flushing
    #[arg(long, default_value_t = 2)]
    pub teardown_timeout: u64,
    /// Maximum number of simultaneous players
    #[arg(long, default_value_t = 16)]
    pub max_pairings: usize,
}

impl Tuning {
    pub fn apply(&self, config: &mut BridgeConfig) {
        config.max_chunk_size = self.chunk_size;
        config.backlog_threshold = self.backlog_threshold;
        config.join_timeout = Duration::from_secs(self.join_timeout);
        config.teardown_timeout = Duration::from_secs(self.teardown_timeout);
        config.max_pairings = self.max_pairings;
    }
}
