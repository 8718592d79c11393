//! The interface the bridge needs from a peer-to-peer transport.
//!
//! The transport owns connection establishment, NAT traversal and delivery.
//! The bridge only opens and closes channels, hands bytes to `send`, and
//! receives bytes through the per-channel [`Inbound`] sink it supplies.

pub mod memory;
pub mod protocol;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::utils::Backlog;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// Opaque identity of a peer as understood by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl FromStr for PeerId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/// Transport-assigned handle of one channel (or of a pending join request)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("peer rejected the channel")]
    Rejected,

    #[error("channel handshake timed out")]
    Timeout,

    #[error("no pending request {0}")]
    UnknownRequest(ChannelHandle),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelHandle),

    #[error("channel {0} is closed")]
    ChannelClosed(ChannelHandle),

    #[error("message of {size} bytes exceeds the transport limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("transport failure: {0}")]
    Failed(String),
}

/// Why the transport closed a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed the channel"),
            CloseReason::Failed(reason) => write!(f, "transport failure: {}", reason),
        }
    }
}

/// Connection-state notifications raised by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer asks to join; answer with `accept` or `close`
    Incoming { request: ChannelHandle, peer: PeerId },
    /// The channel is gone and will deliver nothing more
    Closed { channel: ChannelHandle, reason: CloseReason },
}

/// Where a transport posts its connection-state notifications
#[derive(Debug, Clone)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { tx }
    }

    pub fn incoming(&self, request: ChannelHandle, peer: PeerId) {
        let _ = self.tx.send(TransportEvent::Incoming { request, peer });
    }

    pub fn closed(&self, channel: ChannelHandle, reason: CloseReason) {
        let _ = self.tx.send(TransportEvent::Closed { channel, reason });
    }
}

/// Per-channel receive sink.
///
/// Bounded: a transport awaiting [`Inbound::on_message`] is held back while
/// the bridge is not draining the channel.
#[derive(Debug, Clone)]
pub struct Inbound {
    tx: mpsc::Sender<Bytes>,
}

impl Inbound {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Deliver one message, waiting for queue space. `false` once the bridge
    /// dropped the channel.
    pub async fn on_message(&self, bytes: Bytes) -> bool {
        self.tx.send(bytes).await.is_ok()
    }

    pub fn try_on_message(&self, bytes: Bytes) -> Result<(), mpsc::error::TrySendError<Bytes>> {
        self.tx.try_send(bytes)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Capabilities the bridge requires from a peer-to-peer transport
#[async_trait]
pub trait PeerChannelAdapter: Send + Sync + 'static {
    /// Where `Incoming` and `Closed` notifications should go
    fn register_sink(&self, sink: TransportSink);

    /// Open a channel to `peer`, delivering its messages into `inbound`
    async fn open(&self, peer: &PeerId, inbound: Inbound) -> Result<ChannelHandle, OpenError>;

    /// Accept a pending join request; the request handle becomes the channel handle
    async fn accept(&self, request: ChannelHandle, inbound: Inbound) -> Result<(), OpenError>;

    /// Ordered, reliable, non-blocking send
    fn send(&self, channel: ChannelHandle, bytes: Bytes) -> Result<(), SendError>;

    /// Bytes accepted by `send` on `channel` and not yet handed to the network.
    /// Closed together with the channel.
    fn send_backlog(&self, channel: ChannelHandle) -> Option<Arc<Backlog>>;

    /// Close a channel or reject a pending request. Idempotent.
    ///
    /// Bytes already accepted by `send` are still delivered, ahead of the close.
    fn close(&self, channel: ChannelHandle);

    fn latency(&self, channel: ChannelHandle) -> Option<Duration>;

    fn relay_descriptor(&self, channel: ChannelHandle) -> String;

    /// Largest payload accepted by a single `send`
    fn max_message_size(&self) -> usize;
}
