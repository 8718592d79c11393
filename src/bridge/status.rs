use std::net::SocketAddr;

use super::error::Notice;
use super::pairing::PairingId;
use crate::transport::PeerId;

/// What the session is currently doing
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    Idle,
    Hosting,
    Joined { host: PeerId },
}

impl SessionMode {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionMode::Idle)
    }
}

/// Lifecycle of one endpoint/channel pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Connecting,
    Bridged,
    Closing,
    Closed,
}

/// One row of the diagnostics table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer: PeerId,
    pub pairing: PairingId,
    pub state: PairingState,
    pub latency_ms: Option<u64>,
    pub relay: String,
    /// Bytes waiting to be written to the local game
    pub backlog_bytes: usize,
}

/// Snapshot of the session, published after every change
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub mode: SessionMode,
    pub active_local_connections: usize,
    /// Where the joiner's local game should connect
    pub listen_addr: Option<SocketAddr>,
    /// Remote peers in room order, without ourselves
    pub peers: Vec<PeerStatus>,
    pub last_notice: Option<Notice>,
    /// Bumped with every new notice
    pub notice_seq: u64,
}

impl SessionStatus {
    pub fn peer(&self, peer: &PeerId) -> Option<&PeerStatus> {
        self.peers.iter().find(|row| &row.peer == peer)
    }

    pub fn bridged(&self) -> usize {
        self.peers
            .iter()
            .filter(|row| row.state == PairingState::Bridged)
            .count()
    }
}
