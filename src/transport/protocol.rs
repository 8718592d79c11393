use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::PeerId;

/// Protocol versioning
pub const PROTOCOL_VERSION: u8 = 1;

/// Bytes a frame adds on top of its data payload
pub const FRAME_OVERHEAD: usize = 64;

/// Error types for protocol operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Protocol version mismatch. Expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Unexpected frame: expected {0}")]
    UnexpectedFrame(&'static str),
}

/// Frames exchanged by the direct TCP transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame in each direction; identifies the sender
    Hello { version: u8, identity: PeerId },
    /// Opaque bridged bytes
    Data(Vec<u8>),
    /// Round-trip ping; the nonce is echoed back unchanged
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    /// Orderly shutdown of the channel
    Close,
}

impl Frame {
    pub fn hello(identity: PeerId) -> Self {
        Frame::Hello { version: PROTOCOL_VERSION, identity }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }

    /// Extract the identity carried by a `Hello`, checking its version.
    pub fn into_hello(self) -> Result<PeerId, ProtocolError> {
        match self {
            Frame::Hello { version, identity } if version == PROTOCOL_VERSION => Ok(identity),
            Frame::Hello { version, .. } => {
                Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version))
            }
            _ => Err(ProtocolError::UnexpectedFrame("Hello")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_carries_identity() {
        let encoded = Frame::hello(PeerId::new("alice")).encode().unwrap();
        let identity = Frame::decode(&encoded).unwrap().into_hello().unwrap();
        assert_eq!(identity, PeerId::new("alice"));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let frame = Frame::Hello { version: PROTOCOL_VERSION + 1, identity: PeerId::new("bob") };
        assert!(matches!(
            frame.into_hello(),
            Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, v)) if v == PROTOCOL_VERSION + 1
        ));
        assert!(matches!(Frame::Close.into_hello(), Err(ProtocolError::UnexpectedFrame("Hello"))));
    }

    #[test]
    fn data_overhead_is_bounded() {
        let payload = vec![0xAB; 4096];
        let encoded = Frame::Data(payload.clone()).encode().unwrap();
        assert!(encoded.len() <= payload.len() + FRAME_OVERHEAD);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(Frame::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }
}
