use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Default port the joiner listens on for its local game.
pub const DEFAULT_LISTEN_PORT: u16 = 8888;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("backlog threshold ({threshold}) must be at least the max chunk size ({chunk})")]
    ThresholdBelowChunk { threshold: usize, chunk: usize },

    #[error("inbound queue depth must be greater than zero")]
    ZeroInboundQueue,

    #[error("max pairings must be greater than zero")]
    ZeroPairings,
}

/// Configuration for the bridge session
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interface the local side binds and connects on
    pub bind_ip: IpAddr,
    /// Port the hosted game listens on (host role)
    pub game_port: u16,
    /// Port the joiner listens on for its local game
    pub listen_port: u16,
    /// Largest chunk handed to the transport in one send
    pub max_chunk_size: usize,
    /// Unsent bytes per local endpoint before the paired channel stops being drained
    pub backlog_threshold: usize,
    /// Messages buffered per channel between the transport and the session
    pub inbound_queue: usize,
    /// Deadline for both halves of a pairing to come up
    pub join_timeout: Duration,
    /// How long a closing socket may spend flushing queued bytes
    pub teardown_timeout: Duration,
    /// Maximum number of concurrent pairings
    pub max_pairings: usize,
    /// How often latency and relay diagnostics are refreshed
    pub status_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            game_port: 0,
            listen_port: DEFAULT_LISTEN_PORT,
            max_chunk_size: 64 * 1024,
            backlog_threshold: 1024 * 1024,
            inbound_queue: 64,
            join_timeout: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(2),
            max_pairings: 16,
            status_interval: Duration::from_secs(1),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.backlog_threshold < self.max_chunk_size {
            return Err(ConfigError::ThresholdBelowChunk {
                threshold: self.backlog_threshold,
                chunk: self.max_chunk_size,
            });
        }
        if self.inbound_queue == 0 {
            return Err(ConfigError::ZeroInboundQueue);
        }
        if self.max_pairings == 0 {
            return Err(ConfigError::ZeroPairings);
        }
        Ok(())
    }

    /// Address of the hosted game's own listener
    pub fn game_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.game_port)
    }
}
