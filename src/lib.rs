//! Bridge a LAN game's local TCP traffic over a peer-to-peer transport.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod local;
pub mod presence;
pub mod transport;
pub mod utils;

pub use bridge::{BridgeSession, JoinError, JoinFailure, Notice, SessionError, SessionStatus};
pub use config::BridgeConfig;
pub use presence::{Presence, StaticRoom};
pub use transport::{PeerChannelAdapter, PeerId};
