//! In-process transport for tests and offline development.
//!
//! Every [`MemoryTransport`] created from one [`MemoryNetwork`] can open
//! channels to the others by identity. Delivery is ordered and reliable and
//! honours the bridge's inbound backpressure. Failures, latency and relay paths
//! can be injected per remote peer.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{
    ChannelHandle, CloseReason, Inbound, OpenError, PeerChannelAdapter, PeerId, SendError,
    TransportSink,
};
use crate::utils::{Backlog, lock};

/// How long a closed link may spend delivering what was sent before the close
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for one in-memory node
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub max_message_size: usize,
    /// Merge queued messages before delivery, like a stream transport would
    pub coalesce: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024,
            coalesce: false,
        }
    }
}

/// Registry connecting in-memory transports by identity
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<PeerId, Weak<Node>>>>,
    next_handle: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self, identity: impl Into<PeerId>) -> MemoryTransport {
        self.transport_with(identity, MemoryOptions::default())
    }

    pub fn transport_with(&self, identity: impl Into<PeerId>, options: MemoryOptions) -> MemoryTransport {
        let identity = identity.into();
        let node = Arc::new(Node {
            identity: identity.clone(),
            network: self.clone(),
            options,
            state: Mutex::new(NodeState::default()),
        });
        lock(&self.nodes).insert(identity, Arc::downgrade(&node));
        MemoryTransport { node }
    }

    fn node(&self, identity: &PeerId) -> Option<Arc<Node>> {
        lock(&self.nodes).get(identity).and_then(Weak::upgrade)
    }

    fn allocate(&self) -> ChannelHandle {
        ChannelHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

struct PendingRequest {
    from: Arc<Node>,
    from_handle: ChannelHandle,
    from_inbound: Inbound,
    reply: oneshot::Sender<()>,
}

struct Link {
    peer: PeerId,
    remote: Weak<Node>,
    remote_handle: ChannelHandle,
    outbound: mpsc::UnboundedSender<Bytes>,
    backlog: Arc<Backlog>,
    forwarder: JoinHandle<()>,
}

#[derive(Default)]
struct NodeState {
    sink: Option<TransportSink>,
    pending: HashMap<ChannelHandle, PendingRequest>,
    links: HashMap<ChannelHandle, Link>,
    failing: HashSet<PeerId>,
    latency: HashMap<PeerId, Duration>,
    relay: HashMap<PeerId, String>,
    sends: u64,
}

struct Node {
    identity: PeerId,
    network: MemoryNetwork,
    options: MemoryOptions,
    state: Mutex<NodeState>,
}

impl Node {
    fn sink(&self) -> Option<TransportSink> {
        lock(&self.state).sink.clone()
    }

    /// Install the outbound half of a link, forwarding into `remote_inbound`.
    fn install(
        &self,
        handle: ChannelHandle,
        remote: &Arc<Node>,
        remote_handle: ChannelHandle,
        remote_inbound: Inbound,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(Backlog::new());
        let forwarder = tokio::spawn(forward(
            rx,
            remote_inbound,
            backlog.clone(),
            self.options.coalesce,
            self.options.max_message_size,
        ));
        lock(&self.state).links.insert(
            handle,
            Link {
                peer: remote.identity.clone(),
                remote: Arc::downgrade(remote),
                remote_handle,
                outbound: tx,
                backlog,
                forwarder,
            },
        );
    }

    /// Drop the link behind `handle` and tell whoever is on the far end once
    /// everything already sent has reached it.
    fn sever(&self, handle: ChannelHandle, notify_self: Option<CloseReason>, remote_reason: CloseReason) {
        let Some(link) = lock(&self.state).links.remove(&handle) else {
            return;
        };
        link.backlog.close();
        if let Some(reason) = notify_self {
            if let Some(sink) = self.sink() {
                sink.closed(handle, reason);
            }
        }

        let Link {
            remote,
            remote_handle,
            outbound,
            mut forwarder,
            ..
        } = link;
        // The forwarder finishes once its queue is empty.
        drop(outbound);

        let Some(remote) = remote.upgrade() else {
            return;
        };
        let Some(reverse) = lock(&remote.state).links.remove(&remote_handle) else {
            return;
        };
        reverse.backlog.close();
        drop(reverse);

        tokio::spawn(async move {
            if timeout(DRAIN_TIMEOUT, &mut forwarder).await.is_err() {
                warn!("Link {} did not drain within {:?}", remote_handle, DRAIN_TIMEOUT);
                forwarder.abort();
            }
            if let Some(sink) = remote.sink() {
                sink.closed(remote_handle, remote_reason);
            }
        });
    }
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    inbound: Inbound,
    backlog: Arc<Backlog>,
    coalesce: bool,
    max_message_size: usize,
) {
    while let Some(first) = rx.recv().await {
        let message = if coalesce {
            let mut merged = BytesMut::from(&first[..]);
            while merged.len() < max_message_size {
                match rx.try_recv() {
                    Ok(next) => merged.extend_from_slice(&next),
                    Err(_) => break,
                }
            }
            merged.freeze()
        } else {
            first
        };
        let len = message.len();
        if !inbound.on_message(message).await {
            break;
        }
        backlog.discharge(len);
    }
}

/// One node on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    node: Arc<Node>,
}

impl MemoryTransport {
    pub fn identity(&self) -> &PeerId {
        &self.node.identity
    }

    /// Make every later send towards `peer` fail
    pub fn fail_sends_to(&self, peer: &PeerId) {
        lock(&self.node.state).failing.insert(peer.clone());
    }

    pub fn set_latency(&self, peer: &PeerId, latency: Duration) {
        lock(&self.node.state).latency.insert(peer.clone(), latency);
    }

    pub fn set_relay(&self, peer: &PeerId, descriptor: impl Into<String>) {
        lock(&self.node.state).relay.insert(peer.clone(), descriptor.into());
    }

    /// Simulate the transport dropping a channel; both ends are notified.
    pub fn fail_channel(&self, channel: ChannelHandle) {
        let reason = CloseReason::Failed("injected failure".to_string());
        self.node.sever(channel, Some(reason.clone()), reason);
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.node.state).links.len()
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.node.state).pending.len()
    }

    pub fn channel_to(&self, peer: &PeerId) -> Option<ChannelHandle> {
        lock(&self.node.state)
            .links
            .iter()
            .find(|(_, link)| &link.peer == peer)
            .map(|(handle, _)| *handle)
    }

    /// Successful sends so far
    pub fn sends(&self) -> u64 {
        lock(&self.node.state).sends
    }
}

#[async_trait]
impl PeerChannelAdapter for MemoryTransport {
    fn register_sink(&self, sink: TransportSink) {
        lock(&self.node.state).sink = Some(sink);
    }

    async fn open(&self, peer: &PeerId, inbound: Inbound) -> Result<ChannelHandle, OpenError> {
        let network = &self.node.network;
        let remote = network
            .node(peer)
            .ok_or_else(|| OpenError::Unreachable(peer.to_string()))?;
        let sink = remote
            .sink()
            .ok_or_else(|| OpenError::Unreachable(peer.to_string()))?;

        let from_handle = network.allocate();
        let request = network.allocate();
        let (reply, accepted) = oneshot::channel();
        lock(&remote.state).pending.insert(
            request,
            PendingRequest {
                from: self.node.clone(),
                from_handle,
                from_inbound: inbound,
                reply,
            },
        );
        debug!("{} requests a channel to {} ({})", self.node.identity, peer, request);
        sink.incoming(request, self.node.identity.clone());

        accepted.await.map_err(|_| OpenError::Rejected)?;
        Ok(from_handle)
    }

    async fn accept(&self, request: ChannelHandle, inbound: Inbound) -> Result<(), OpenError> {
        let pending = lock(&self.node.state)
            .pending
            .remove(&request)
            .ok_or(OpenError::UnknownRequest(request))?;

        self.node.install(request, &pending.from, pending.from_handle, pending.from_inbound);
        pending.from.install(pending.from_handle, &self.node, request, inbound);

        if pending.reply.send(()).is_err() {
            // The opener gave up while we were accepting.
            self.node.sever(request, None, CloseReason::PeerClosed);
            return Err(OpenError::Rejected);
        }
        Ok(())
    }

    fn send(&self, channel: ChannelHandle, bytes: Bytes) -> Result<(), SendError> {
        let limit = self.node.options.max_message_size;
        if bytes.len() > limit {
            return Err(SendError::TooLarge { size: bytes.len(), limit });
        }
        let mut state = lock(&self.node.state);
        let link = state
            .links
            .get(&channel)
            .ok_or(SendError::UnknownChannel(channel))?;
        if state.failing.contains(&link.peer) {
            return Err(SendError::Failed(format!("injected send failure to {}", link.peer)));
        }
        let len = bytes.len();
        link.backlog.charge(len);
        if link.outbound.send(bytes).is_err() {
            link.backlog.discharge(len);
            return Err(SendError::ChannelClosed(channel));
        }
        state.sends += 1;
        Ok(())
    }

    fn send_backlog(&self, channel: ChannelHandle) -> Option<Arc<Backlog>> {
        lock(&self.node.state)
            .links
            .get(&channel)
            .map(|link| link.backlog.clone())
    }

    fn close(&self, channel: ChannelHandle) {
        let rejected = lock(&self.node.state).pending.remove(&channel);
        if rejected.is_some() {
            debug!("{} rejected request {}", self.node.identity, channel);
            return;
        }
        self.node.sever(channel, None, CloseReason::PeerClosed);
    }

    fn latency(&self, channel: ChannelHandle) -> Option<Duration> {
        let state = lock(&self.node.state);
        let link = state.links.get(&channel)?;
        state.latency.get(&link.peer).copied()
    }

    fn relay_descriptor(&self, channel: ChannelHandle) -> String {
        let state = lock(&self.node.state);
        match state.links.get(&channel) {
            Some(link) => state
                .relay
                .get(&link.peer)
                .cloned()
                .unwrap_or_else(|| "direct".to_string()),
            None => "N/A".to_string(),
        }
    }

    fn max_message_size(&self) -> usize {
        self.node.options.max_message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use tokio::time::timeout;

    fn with_sink(transport: &MemoryTransport) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.register_sink(TransportSink::new(tx));
        rx
    }

    async fn connect(
        a: &MemoryTransport,
        b: &MemoryTransport,
        b_events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (ChannelHandle, mpsc::Receiver<Bytes>, ChannelHandle, mpsc::Receiver<Bytes>) {
        let (a_inbound, a_rx) = Inbound::channel(16);
        let opener = {
            let a = a.clone();
            let peer = b.identity().clone();
            tokio::spawn(async move { a.open(&peer, a_inbound).await })
        };
        let request = match timeout(Duration::from_secs(1), b_events.recv()).await.unwrap() {
            Some(TransportEvent::Incoming { request, peer }) => {
                assert_eq!(&peer, a.identity());
                request
            }
            other => panic!("unexpected event: {:?}", other),
        };
        let (b_inbound, b_rx) = Inbound::channel(16);
        b.accept(request, b_inbound).await.unwrap();
        let a_handle = opener.await.unwrap().unwrap();
        (a_handle, a_rx, request, b_rx)
    }

    #[tokio::test]
    async fn delivers_in_order_both_ways() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let _a_events = with_sink(&a);
        let mut b_events = with_sink(&b);

        let (a_handle, mut a_rx, b_handle, mut b_rx) = connect(&a, &b, &mut b_events).await;
        for i in 0..10u8 {
            a.send(a_handle, Bytes::from(vec![i])).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(b_rx.recv().await.unwrap(), Bytes::from(vec![i]));
        }

        b.send(b_handle, Bytes::from_static(b"reply")).unwrap();
        assert_eq!(a_rx.recv().await.unwrap(), Bytes::from_static(b"reply"));
        assert_eq!(a.open_channels(), 1);
        assert_eq!(a.channel_to(b.identity()), Some(a_handle));
    }

    #[tokio::test]
    async fn rejection_and_unknown_peers_fail_open() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let mut b_events = with_sink(&b);

        let (inbound, _rx) = Inbound::channel(1);
        assert_eq!(
            a.open(&PeerId::new("nobody"), inbound.clone()).await,
            Err(OpenError::Unreachable("nobody".to_string()))
        );

        let opener = {
            let a = a.clone();
            tokio::spawn(async move { a.open(&PeerId::new("b"), inbound).await })
        };
        if let Some(TransportEvent::Incoming { request, .. }) = b_events.recv().await {
            b.close(request);
        }
        assert_eq!(opener.await.unwrap(), Err(OpenError::Rejected));
        assert_eq!(b.pending_requests(), 0);
    }

    #[tokio::test]
    async fn close_notifies_remote_only() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let mut a_events = with_sink(&a);
        let mut b_events = with_sink(&b);

        let (a_handle, _a_rx, b_handle, _b_rx) = connect(&a, &b, &mut b_events).await;
        a.close(a_handle);
        a.close(a_handle);

        assert_eq!(
            b_events.recv().await,
            Some(TransportEvent::Closed { channel: b_handle, reason: CloseReason::PeerClosed })
        );
        assert!(a_events.try_recv().is_err());
        assert_eq!(a.open_channels() + b.open_channels(), 0);
    }

    #[tokio::test]
    async fn injected_failures_and_diagnostics() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let _a_events = with_sink(&a);
        let mut b_events = with_sink(&b);

        let (a_handle, ..) = connect(&a, &b, &mut b_events).await;
        assert_eq!(a.latency(a_handle), None);
        assert_eq!(a.relay_descriptor(a_handle), "direct");

        a.set_latency(b.identity(), Duration::from_millis(42));
        a.set_relay(b.identity(), "relayed via fra");
        assert_eq!(a.latency(a_handle), Some(Duration::from_millis(42)));
        assert_eq!(a.relay_descriptor(a_handle), "relayed via fra");

        a.fail_sends_to(b.identity());
        assert!(matches!(
            a.send(a_handle, Bytes::from_static(b"x")),
            Err(SendError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn coalescing_merges_queued_messages() {
        let network = MemoryNetwork::new();
        let options = MemoryOptions { max_message_size: 1024, coalesce: true };
        let a = network.transport_with("a", options);
        let b = network.transport("b");
        let _a_events = with_sink(&a);
        let mut b_events = with_sink(&b);

        let (a_handle, _a_rx, _b_handle, mut b_rx) = connect(&a, &b, &mut b_events).await;
        for chunk in [&b"ab"[..], b"cd", b"ef"] {
            a.send(a_handle, Bytes::copy_from_slice(chunk)).unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 6 {
            let message = timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap();
            received.extend_from_slice(&message);
        }
        assert_eq!(received, b"abcdef");
    }

    #[tokio::test]
    async fn close_delivers_queued_messages_first() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let _a_events = with_sink(&a);
        let mut b_events = with_sink(&b);

        let (a_handle, _a_rx, b_handle, mut b_rx) = connect(&a, &b, &mut b_events).await;
        for i in 0..200u8 {
            a.send(a_handle, Bytes::from(vec![i; 100])).unwrap();
        }
        a.close(a_handle);

        let mut received = 0;
        while let Some(message) = timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap() {
            assert_eq!(message, Bytes::from(vec![received; 100]));
            received += 1;
        }
        assert_eq!(received, 200);
        assert_eq!(
            b_events.recv().await,
            Some(TransportEvent::Closed { channel: b_handle, reason: CloseReason::PeerClosed })
        );
    }

    #[tokio::test]
    async fn send_backlog_counts_undelivered_bytes() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let _a_events = with_sink(&a);
        let mut b_events = with_sink(&b);

        let (a_handle, _a_rx, _b_handle, mut b_rx) = connect(&a, &b, &mut b_events).await;
        let backlog = a.send_backlog(a_handle).unwrap();
        for _ in 0..20 {
            a.send(a_handle, Bytes::from(vec![0u8; 10])).unwrap();
        }

        // `b` is not reading: 16 messages fit its inbound queue, the rest wait.
        timeout(Duration::from_secs(1), async {
            while backlog.pending() != 40 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        for _ in 0..20 {
            b_rx.recv().await.unwrap();
        }
        timeout(Duration::from_secs(1), async {
            while backlog.pending() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        a.close(a_handle);
        assert!(backlog.is_closed());
        assert!(a.send_backlog(a_handle).is_none());
    }
}
