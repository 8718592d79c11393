//! Pairs local game connections with peer channels and relays bytes between them.

pub mod chunking;
pub mod error;
mod pairing;
pub mod session;
pub mod status;

pub use chunking::Chunker;
pub use error::{JoinError, JoinFailure, Notice, SessionError, TeardownCause};
pub use pairing::PairingId;
pub use session::BridgeSession;
pub use status::{PairingState, PeerStatus, SessionMode, SessionStatus};
