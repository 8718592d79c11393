//! Direct TCP transport.
//!
//! Joiners connect straight to the host's `ip:port`, so this only works where
//! the host is reachable (LAN, VPN, forwarded port). It does no NAT traversal
//! and no encryption.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{FRAME_OVERHEAD, Frame, ProtocolError};
use super::{
    ChannelHandle, CloseReason, Inbound, OpenError, PeerChannelAdapter, PeerId, SendError,
    TransportSink,
};
use crate::utils::{Backlog, back_off_accept, lock};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(1);
/// How long a locally closed channel may spend writing out queued frames
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

struct PendingPeer {
    framed: FramedStream,
    peer: PeerId,
    addr: SocketAddr,
}

struct Channel {
    peer: PeerId,
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Frame>,
    backlog: Arc<Backlog>,
    rtt: Option<Duration>,
    cancel: CancellationToken,
}

struct Inner {
    identity: PeerId,
    max_message_size: usize,
    next_handle: AtomicU64,
    sink: Mutex<Option<TransportSink>>,
    pending: Mutex<HashMap<ChannelHandle, PendingPeer>>,
    channels: Mutex<HashMap<ChannelHandle, Channel>>,
    shutdown: CancellationToken,
}

/// Peer transport over plain TCP connections
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

enum DriverExit {
    Local,
    Peer,
    Failed(String),
}

impl TcpTransport {
    pub fn new(identity: PeerId) -> Self {
        Self::with_max_message_size(identity, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(identity: PeerId, max_message_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                max_message_size,
                next_handle: AtomicU64::new(1),
                sink: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn identity(&self) -> &PeerId {
        &self.inner.identity
    }

    /// Accept join requests on `addr` (host role). Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Peer transport listening on {}", local_addr);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    result = listener.accept() => result,
                };
                match result {
                    Ok((stream, addr)) => {
                        debug!("Peer connection from {}", addr);
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.receive_hello(stream, addr).await {
                                warn!("Dropping peer connection from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => back_off_accept("peer connection", &e).await,
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop listening and drop every channel.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        lock(&self.inner.pending).clear();
        for (_, channel) in lock(&self.inner.channels).drain() {
            channel.cancel.cancel();
            channel.backlog.close();
        }
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    pub fn channel_to(&self, peer: &PeerId) -> Option<ChannelHandle> {
        lock(&self.inner.channels)
            .iter()
            .find(|(_, channel)| &channel.peer == peer)
            .map(|(handle, _)| *handle)
    }
}

impl Inner {
    fn framed(&self, stream: TcpStream) -> FramedStream {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.max_message_size + FRAME_OVERHEAD)
            .new_codec();
        Framed::new(stream, codec)
    }

    fn allocate(&self) -> ChannelHandle {
        ChannelHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn sink(&self) -> Option<TransportSink> {
        lock(&self.sink).clone()
    }

    async fn receive_hello(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), OpenError> {
        let mut framed = self.framed(stream);
        let peer = read_hello(&mut framed).await?;

        let Some(sink) = self.sink() else {
            return Err(OpenError::Handshake("no sink registered".to_string()));
        };

        let request = self.allocate();
        info!("Join request {} from {} ({})", request, peer, addr);
        lock(&self.pending).insert(request, PendingPeer { framed, peer: peer.clone(), addr });
        sink.incoming(request, peer);
        Ok(())
    }

    fn register(
        self: &Arc<Self>,
        handle: ChannelHandle,
        peer: PeerId,
        addr: SocketAddr,
        framed: FramedStream,
        inbound: Inbound,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        let backlog = Arc::new(Backlog::new());
        lock(&self.channels).insert(
            handle,
            Channel {
                peer: peer.clone(),
                addr,
                outbound: tx.clone(),
                backlog: backlog.clone(),
                rtt: None,
                cancel: cancel.clone(),
            },
        );
        info!("Channel {} open to {} ({})", handle, peer, addr);

        let inner = self.clone();
        tokio::spawn(async move {
            let outbound = Outbound { tx, rx, backlog };
            let exit = inner.drive(handle, framed, inbound, outbound, cancel).await;
            // Present only if the channel was not closed from this side.
            let removed = lock(&inner.channels).remove(&handle).is_some();
            let reason = match exit {
                DriverExit::Local => return,
                DriverExit::Peer => CloseReason::PeerClosed,
                DriverExit::Failed(reason) => CloseReason::Failed(reason),
            };
            info!("Channel {} closed: {}", handle, reason);
            if removed {
                if let Some(sink) = inner.sink() {
                    sink.closed(handle, reason);
                }
            }
        });
    }

    async fn drive(
        &self,
        handle: ChannelHandle,
        framed: FramedStream,
        inbound: Inbound,
        outbound: Outbound,
        cancel: CancellationToken,
    ) -> DriverExit {
        let (mut writer, mut reader) = framed.split();
        let epoch = Instant::now();
        let Outbound {
            tx: outbound_tx,
            rx: mut outbound_rx,
            backlog,
        } = outbound;

        let write_side = async {
            let mut ping = interval(PING_INTERVAL);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => {
                        let flush = async {
                            // Everything `send` accepted goes out ahead of the close.
                            while let Ok(frame) = outbound_rx.try_recv() {
                                let charged = charged_len(&frame);
                                let Ok(encoded) = frame.encode() else {
                                    break;
                                };
                                if writer.feed(encoded).await.is_err() {
                                    return;
                                }
                                backlog.discharge(charged);
                            }
                            if let Ok(close) = Frame::Close.encode() {
                                let _ = writer.send(close).await;
                            }
                        };
                        if timeout(CLOSE_TIMEOUT, flush).await.is_err() {
                            debug!("Channel {} closed before its queue was written", handle);
                        }
                        return DriverExit::Local;
                    }
                    _ = ping.tick() => Frame::Ping { nonce: epoch.elapsed().as_micros() as u64 },
                    next = outbound_rx.recv() => match next {
                        Some(frame) => frame,
                        None => return DriverExit::Local,
                    },
                };
                let charged = charged_len(&frame);
                let encoded = match frame.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => return DriverExit::Failed(e.to_string()),
                };
                if let Err(e) = writer.send(encoded).await {
                    return DriverExit::Failed(e.to_string());
                }
                backlog.discharge(charged);
            }
        };

        let read_side = async {
            loop {
                let data = match reader.next().await {
                    None => return DriverExit::Peer,
                    Some(Err(e)) => return DriverExit::Failed(e.to_string()),
                    Some(Ok(data)) => data,
                };
                match Frame::decode(&data) {
                    Ok(Frame::Data(bytes)) => {
                        if !inbound.on_message(Bytes::from(bytes)).await {
                            return DriverExit::Local;
                        }
                    }
                    Ok(Frame::Ping { nonce }) => {
                        let _ = outbound_tx.send(Frame::Pong { nonce });
                    }
                    Ok(Frame::Pong { nonce }) => {
                        let sent = Duration::from_micros(nonce);
                        let rtt = epoch.elapsed().saturating_sub(sent);
                        if let Some(channel) = lock(&self.channels).get_mut(&handle) {
                            channel.rtt = Some(rtt);
                        }
                    }
                    Ok(Frame::Close) => return DriverExit::Peer,
                    Ok(Frame::Hello { .. }) => warn!("Ignoring repeated hello on channel {}", handle),
                    Err(e) => return DriverExit::Failed(e.to_string()),
                }
            }
        };

        let exit = tokio::select! {
            exit = write_side => exit,
            exit = read_side => exit,
        };
        backlog.close();
        exit
    }
}

/// Queue feeding one channel's writer
struct Outbound {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
    backlog: Arc<Backlog>,
}

/// Bytes of a frame that count towards the send backlog
fn charged_len(frame: &Frame) -> usize {
    match frame {
        Frame::Data(data) => data.len(),
        _ => 0,
    }
}

async fn read_hello(framed: &mut FramedStream) -> Result<PeerId, OpenError> {
    let frame = match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Err(_) => return Err(OpenError::Timeout),
        // The host hangs up instead of answering when it rejects a join.
        Ok(None) => return Err(OpenError::Rejected),
        Ok(Some(Err(e))) => return Err(OpenError::Handshake(e.to_string())),
        Ok(Some(Ok(data))) => Frame::decode(&data).map_err(handshake_error)?,
    };
    match frame {
        Frame::Close => Err(OpenError::Rejected),
        frame => frame.into_hello().map_err(handshake_error),
    }
}

async fn write_frame(framed: &mut FramedStream, frame: Frame) -> Result<(), OpenError> {
    let encoded = frame.encode().map_err(handshake_error)?;
    framed
        .send(encoded)
        .await
        .map_err(|e| OpenError::Handshake(e.to_string()))
}

fn handshake_error(e: ProtocolError) -> OpenError {
    OpenError::Handshake(e.to_string())
}

#[async_trait]
impl PeerChannelAdapter for TcpTransport {
    fn register_sink(&self, sink: TransportSink) {
        *lock(&self.inner.sink) = Some(sink);
    }

    async fn open(&self, peer: &PeerId, inbound: Inbound) -> Result<ChannelHandle, OpenError> {
        let addr = tokio::net::lookup_host(peer.as_str())
            .await
            .map_err(|e| OpenError::Unreachable(format!("{}: {}", peer, e)))?
            .next()
            .ok_or_else(|| OpenError::Unreachable(format!("{}: no address", peer)))?;

        debug!("Connecting to peer {} at {}", peer, addr);
        let stream = match timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr)).await {
            Err(_) => return Err(OpenError::Timeout),
            Ok(Err(e)) => return Err(OpenError::Unreachable(format!("{}: {}", addr, e))),
            Ok(Ok(stream)) => stream,
        };

        let mut framed = self.inner.framed(stream);
        write_frame(&mut framed, Frame::hello(self.inner.identity.clone())).await?;
        let identity = read_hello(&mut framed).await?;
        if &identity != peer {
            debug!("Peer at {} identifies as {}", addr, identity);
        }

        let handle = self.inner.allocate();
        self.inner.register(handle, peer.clone(), addr, framed, inbound);
        Ok(handle)
    }

    async fn accept(&self, request: ChannelHandle, inbound: Inbound) -> Result<(), OpenError> {
        let PendingPeer { mut framed, peer, addr } = lock(&self.inner.pending)
            .remove(&request)
            .ok_or(OpenError::UnknownRequest(request))?;

        write_frame(&mut framed, Frame::hello(self.inner.identity.clone())).await?;
        self.inner.register(request, peer, addr, framed, inbound);
        Ok(())
    }

    fn send(&self, channel: ChannelHandle, bytes: Bytes) -> Result<(), SendError> {
        if bytes.len() > self.inner.max_message_size {
            return Err(SendError::TooLarge {
                size: bytes.len(),
                limit: self.inner.max_message_size,
            });
        }
        let channels = lock(&self.inner.channels);
        let entry = channels
            .get(&channel)
            .ok_or(SendError::UnknownChannel(channel))?;
        let len = bytes.len();
        entry.backlog.charge(len);
        if entry.outbound.send(Frame::Data(bytes.to_vec())).is_err() {
            entry.backlog.discharge(len);
            return Err(SendError::ChannelClosed(channel));
        }
        Ok(())
    }

    fn send_backlog(&self, channel: ChannelHandle) -> Option<Arc<Backlog>> {
        lock(&self.inner.channels)
            .get(&channel)
            .map(|entry| entry.backlog.clone())
    }

    fn close(&self, channel: ChannelHandle) {
        if let Some(PendingPeer { mut framed, addr, .. }) = lock(&self.inner.pending).remove(&channel) {
            debug!("Rejecting join request {} from {}", channel, addr);
            tokio::spawn(async move {
                let _ = write_frame(&mut framed, Frame::Close).await;
            });
            return;
        }
        if let Some(entry) = lock(&self.inner.channels).remove(&channel) {
            debug!("Closing channel {} to {}", channel, entry.peer);
            entry.cancel.cancel();
        }
    }

    fn latency(&self, channel: ChannelHandle) -> Option<Duration> {
        lock(&self.inner.channels).get(&channel).and_then(|c| c.rtt)
    }

    fn relay_descriptor(&self, channel: ChannelHandle) -> String {
        match lock(&self.inner.channels).get(&channel) {
            Some(entry) => format!("direct ({})", entry.addr),
            None => "N/A".to_string(),
        }
    }

    fn max_message_size(&self) -> usize {
        self.inner.max_message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;

    async fn host() -> (TcpTransport, SocketAddr, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = TcpTransport::new(PeerId::new("host"));
        let (tx, rx) = mpsc::unbounded_channel();
        transport.register_sink(TransportSink::new(tx));
        let addr = transport.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (transport, addr, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    struct Pair {
        host: TcpTransport,
        host_events: mpsc::UnboundedReceiver<TransportEvent>,
        host_rx: mpsc::Receiver<Bytes>,
        request: ChannelHandle,
        joiner: TcpTransport,
        _joiner_rx: mpsc::Receiver<Bytes>,
        channel: ChannelHandle,
    }

    async fn connected(host_queue: usize) -> Pair {
        let (host, addr, mut host_events) = host().await;
        let joiner = TcpTransport::new(PeerId::new("joiner"));
        let (inbound, joiner_rx) = Inbound::channel(8);
        let open = {
            let joiner = joiner.clone();
            let peer = PeerId::new(addr.to_string());
            tokio::spawn(async move { joiner.open(&peer, inbound).await })
        };
        let request = match next_event(&mut host_events).await {
            TransportEvent::Incoming { request, .. } => request,
            other => panic!("unexpected event: {:?}", other),
        };
        let (host_inbound, host_rx) = Inbound::channel(host_queue);
        host.accept(request, host_inbound).await.unwrap();
        let channel = open.await.unwrap().unwrap();
        Pair {
            host,
            host_events,
            host_rx,
            request,
            joiner,
            _joiner_rx: joiner_rx,
            channel,
        }
    }

    #[tokio::test]
    async fn join_request_then_data_both_ways() {
        let (host, addr, mut host_events) = host().await;
        let joiner = TcpTransport::new(PeerId::new("joiner"));
        let (joiner_tx, _joiner_events) = mpsc::unbounded_channel();
        joiner.register_sink(TransportSink::new(joiner_tx));

        let (joiner_inbound, mut joiner_rx) = Inbound::channel(8);
        let open = {
            let joiner = joiner.clone();
            let peer = PeerId::new(addr.to_string());
            tokio::spawn(async move { joiner.open(&peer, joiner_inbound).await })
        };

        let request = match next_event(&mut host_events).await {
            TransportEvent::Incoming { request, peer } => {
                assert_eq!(peer, PeerId::new("joiner"));
                request
            }
            other => panic!("unexpected event: {:?}", other),
        };
        let (host_inbound, mut host_rx) = Inbound::channel(8);
        host.accept(request, host_inbound).await.unwrap();
        let channel = open.await.unwrap().unwrap();

        joiner.send(channel, Bytes::from_static(b"ping from joiner")).unwrap();
        assert_eq!(host_rx.recv().await.unwrap(), Bytes::from_static(b"ping from joiner"));

        host.send(request, Bytes::from_static(b"hello back")).unwrap();
        assert_eq!(joiner_rx.recv().await.unwrap(), Bytes::from_static(b"hello back"));
        assert!(host.relay_descriptor(request).starts_with("direct"));
    }

    #[tokio::test]
    async fn rejected_request_fails_open() {
        let (host, addr, mut host_events) = host().await;
        let joiner = TcpTransport::new(PeerId::new("joiner"));
        let (inbound, _rx) = Inbound::channel(8);

        let open = {
            let joiner = joiner.clone();
            let peer = PeerId::new(addr.to_string());
            tokio::spawn(async move { joiner.open(&peer, inbound).await })
        };
        if let TransportEvent::Incoming { request, .. } = next_event(&mut host_events).await {
            host.close(request);
        }
        assert_eq!(open.await.unwrap(), Err(OpenError::Rejected));
    }

    #[tokio::test]
    async fn closing_one_side_notifies_the_other() {
        let (host, addr, mut host_events) = host().await;
        let joiner = TcpTransport::new(PeerId::new("joiner"));
        let (inbound, _rx) = Inbound::channel(8);

        let open = {
            let joiner = joiner.clone();
            let peer = PeerId::new(addr.to_string());
            tokio::spawn(async move { joiner.open(&peer, inbound).await })
        };
        let request = match next_event(&mut host_events).await {
            TransportEvent::Incoming { request, .. } => request,
            other => panic!("unexpected event: {:?}", other),
        };
        let (host_inbound, _host_rx) = Inbound::channel(8);
        host.accept(request, host_inbound).await.unwrap();
        let channel = open.await.unwrap().unwrap();

        joiner.close(channel);
        joiner.close(channel);
        assert_eq!(
            next_event(&mut host_events).await,
            TransportEvent::Closed { channel: request, reason: CloseReason::PeerClosed }
        );
        assert_eq!(host.open_channels(), 0);
        assert!(matches!(
            host.send(request, Bytes::from_static(b"late")),
            Err(SendError::UnknownChannel(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_peer_fails_open() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);

        let joiner = TcpTransport::new(PeerId::new("joiner"));
        let (inbound, _rx) = Inbound::channel(8);
        let result = joiner.open(&PeerId::new(addr.to_string()), inbound).await;
        assert!(matches!(result, Err(OpenError::Unreachable(_))));
    }

    #[test]
    fn oversized_send_is_refused() {
        let transport = TcpTransport::with_max_message_size(PeerId::new("a"), 16);
        assert_eq!(
            transport.send(ChannelHandle(1), Bytes::from(vec![0u8; 17])),
            Err(SendError::TooLarge { size: 17, limit: 16 })
        );
    }

    #[tokio::test]
    async fn close_writes_out_queued_frames_first() {
        let mut pair = connected(8).await;
        let frame = vec![0x5au8; 1024];
        for _ in 0..2000 {
            pair.joiner.send(pair.channel, Bytes::from(frame.clone())).unwrap();
        }
        pair.joiner.close(pair.channel);

        let mut received = 0;
        while let Some(message) = timeout(Duration::from_secs(5), pair.host_rx.recv()).await.unwrap() {
            assert_eq!(message.len(), 1024);
            received += 1;
        }
        assert_eq!(received, 2000);
        assert_eq!(
            next_event(&mut pair.host_events).await,
            TransportEvent::Closed { channel: pair.request, reason: CloseReason::PeerClosed }
        );
    }

    #[tokio::test]
    async fn send_backlog_drains_as_frames_are_written() {
        let mut pair = connected(64).await;
        let backlog = pair.joiner.send_backlog(pair.channel).unwrap();
        for _ in 0..32 {
            pair.joiner.send(pair.channel, Bytes::from(vec![1u8; 4096])).unwrap();
        }
        assert!(backlog.pending() <= 32 * 4096);

        for _ in 0..32 {
            timeout(Duration::from_secs(2), pair.host_rx.recv()).await.unwrap().unwrap();
        }
        timeout(Duration::from_secs(2), async {
            while backlog.pending() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        pair.host.close(pair.request);
        timeout(Duration::from_secs(2), async {
            while !backlog.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(pair.joiner.send_backlog(pair.channel).is_none());
    }
}
