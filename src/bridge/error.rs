use std::fmt;
use std::io;
use thiserror::Error;

use crate::local::{BindError, ConnectionLost};
use crate::transport::{CloseReason, OpenError, PeerId, SendError};

/// Why a pairing never reached the bridged state
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinFailure {
    #[error("local game did not connect in time")]
    LocalConnectTimeout,

    #[error("could not reach the local game: {0:?}")]
    LocalConnect(io::ErrorKind),

    #[error("peer channel did not open in time")]
    PeerOpenTimeout,

    #[error("peer channel failed to open: {0}")]
    Open(#[from] OpenError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("session is already hosting or joined")]
    AlreadyActive,

    #[error("cannot listen for the local game: {0}")]
    Bind(#[from] BindError),

    #[error("session has shut down")]
    SessionClosed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is already hosting or joined")]
    AlreadyActive,

    #[error("session has shut down")]
    SessionClosed,
}

/// What ended a bridged or connecting pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownCause {
    Local(ConnectionLost),
    Channel(CloseReason),
    Send(SendError),
}

impl fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownCause::Local(reason) => write!(f, "local connection lost: {}", reason),
            TeardownCause::Channel(reason) => write!(f, "{}", reason),
            TeardownCause::Send(err) => write!(f, "send failed: {}", err),
        }
    }
}

/// Transient message for whoever renders the session status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    JoinFailed { peer: PeerId, reason: JoinFailure },
    PairingClosed { peer: PeerId, cause: TeardownCause },
    Rejected { peer: PeerId },
    ResourceExhausted { limit: usize },
    Disconnected,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::JoinFailed { peer, reason } => write!(f, "join with {} failed: {}", peer, reason),
            Notice::PairingClosed { peer, cause } => write!(f, "{} left: {}", peer, cause),
            Notice::Rejected { peer } => write!(f, "rejected join request from {}", peer),
            Notice::ResourceExhausted { limit } => {
                write!(f, "too many players (limit {}), session stopped", limit)
            }
            Notice::Disconnected => write!(f, "disconnected"),
        }
    }
}
