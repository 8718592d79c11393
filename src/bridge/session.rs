use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::chunking::Chunker;
use super::error::{JoinError, JoinFailure, Notice, SessionError, TeardownCause};
use super::pairing::{LocalSide, PairingId, PairingTable, PendingLocal};
use super::status::{PairingState, PeerStatus, SessionMode, SessionStatus};
use crate::config::{BridgeConfig, ConfigError};
use crate::local::{
    AcceptedConnection, LocalListener, LocalSocket, ReadGate, SocketEvent, SocketOptions,
};
use crate::presence::Presence;
use crate::transport::{
    ChannelHandle, Inbound, PeerChannelAdapter, PeerId, SendError, TransportEvent, TransportSink,
};
use crate::utils::Backlog;

enum Command {
    StartHosting(oneshot::Sender<Result<(), SessionError>>),
    Join(PeerId, oneshot::Sender<Result<(), JoinError>>),
    Disconnect(oneshot::Sender<()>),
}

/// Results of work the session handed off to its own tasks
enum Completion {
    HostHandshake {
        pairing: PairingId,
        result: Result<TcpStream, JoinFailure>,
    },
    JoinOpened {
        pairing: PairingId,
        result: Result<ChannelHandle, JoinFailure>,
    },
    JoinDeadline {
        pairing: PairingId,
    },
    PeerData {
        pairing: PairingId,
        bytes: Bytes,
        queued: oneshot::Sender<()>,
    },
    /// Posted after the pump's last `PeerData`
    PumpDone {
        pairing: PairingId,
    },
    DrainDeadline {
        pairing: PairingId,
    },
}

/// Handle to the bridge. Cheap to clone; the session stops when the last
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct BridgeSession {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl BridgeSession {
    /// Start the session task. Must be called from within a tokio runtime.
    pub fn spawn(
        config: BridgeConfig,
        adapter: Arc<dyn PeerChannelAdapter>,
        presence: Arc<dyn Presence>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (sockets_tx, sockets_rx) = mpsc::unbounded_channel();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        adapter.register_sink(TransportSink::new(transport_tx));
        let chunker = Chunker::for_transport(config.max_chunk_size, adapter.max_message_size());
        let identity = presence.current_identity();
        debug!(
            "Session for {} chunks local data into {} byte messages",
            identity,
            chunker.chunk_size()
        );

        let actor = SessionActor {
            listener: LocalListener::new(config.bind_ip),
            config,
            adapter,
            presence,
            identity,
            chunker,
            mode: SessionMode::Idle,
            table: PairingTable::default(),
            shutdown: CancellationToken::new(),
            status: status_tx,
            last_notice: None,
            notice_seq: 0,
            completions_tx,
            sockets_tx,
            accepted_tx,
        };
        let inboxes = Inboxes {
            transport: transport_rx,
            sockets: sockets_rx,
            accepted: accepted_rx,
            completions: completions_rx,
        };
        tokio::spawn(actor.run(commands_rx, inboxes));

        Ok(Self {
            commands: commands_tx,
            status: status_rx,
        })
    }

    /// Serve join requests, pairing each with a fresh connection to the game port.
    pub async fn start_hosting(&self) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::StartHosting(reply))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        response.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Listen for the local game and open a channel to `host`.
    ///
    /// Returns once both are under way; a pairing that never comes up is
    /// reported through the status as `JoinFailed`.
    pub async fn join_host(&self, host: PeerId) -> Result<(), JoinError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Join(host, reply))
            .await
            .map_err(|_| JoinError::SessionClosed)?;
        response.await.map_err(|_| JoinError::SessionClosed)?
    }

    /// Tear down every pairing and return to idle. Idempotent.
    pub async fn disconnect(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Disconnect(reply)).await.is_ok() {
            let _ = response.await;
        }
    }

    /// Latest published snapshot
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

struct Inboxes {
    transport: mpsc::UnboundedReceiver<TransportEvent>,
    sockets: mpsc::UnboundedReceiver<SocketEvent>,
    accepted: mpsc::UnboundedReceiver<AcceptedConnection>,
    completions: mpsc::UnboundedReceiver<Completion>,
}

/// Sole owner of the pairing table
struct SessionActor {
    config: BridgeConfig,
    adapter: Arc<dyn PeerChannelAdapter>,
    presence: Arc<dyn Presence>,
    identity: PeerId,
    chunker: Chunker,
    mode: SessionMode,
    table: PairingTable,
    listener: LocalListener,
    /// Parent of every host-side local connection
    shutdown: CancellationToken,
    status: watch::Sender<SessionStatus>,
    last_notice: Option<Notice>,
    notice_seq: u64,
    completions_tx: mpsc::UnboundedSender<Completion>,
    sockets_tx: mpsc::UnboundedSender<SocketEvent>,
    accepted_tx: mpsc::UnboundedSender<AcceptedConnection>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inboxes: Inboxes) {
        let mut refresh = interval(self.config.status_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Bridge session started as {}", self.identity);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = inboxes.transport.recv() => self.handle_transport(event),
                Some(event) = inboxes.sockets.recv() => self.handle_socket(event),
                Some(connection) = inboxes.accepted.recv() => self.handle_accepted(connection),
                Some(completion) = inboxes.completions.recv() => self.handle_completion(completion),
                _ = refresh.tick() => self.refresh_diagnostics(),
            }
            debug_assert!(self.table.is_consistent(), "pairing indices out of sync");
        }

        self.close_all();
        self.shutdown.cancel();
        self.publish();
        info!("Bridge session for {} stopped", self.identity);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartHosting(reply) => {
                let _ = reply.send(self.start_hosting());
            }
            Command::Join(host, reply) => {
                let result = self.join_host(host).await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(());
            }
        }
    }

    fn start_hosting(&mut self) -> Result<(), SessionError> {
        if !self.mode.is_idle() {
            return Err(SessionError::AlreadyActive);
        }
        info!("Hosting; joiners will be bridged to {}", self.config.game_addr());
        self.mode = SessionMode::Hosting;
        self.publish();
        Ok(())
    }

    async fn join_host(&mut self, host: PeerId) -> Result<(), JoinError> {
        if !self.mode.is_idle() {
            return Err(JoinError::AlreadyActive);
        }
        self.listener
            .start(self.config.listen_port, self.accepted_tx.clone())
            .await?;
        if let Some(addr) = self.listener.local_addr() {
            info!("Joining {}; point the game at {}", host, addr);
        }

        let id = self.table.insert(host.clone());
        let (inbound, inbound_rx) = Inbound::channel(self.config.inbound_queue);
        let join_timeout = self.config.join_timeout;

        let open = tokio::spawn({
            let adapter = self.adapter.clone();
            let completions = self.completions_tx.clone();
            let host = host.clone();
            async move {
                let result = match timeout(join_timeout, adapter.open(&host, inbound)).await {
                    Ok(Ok(channel)) => Ok(channel),
                    Ok(Err(e)) => Err(JoinFailure::Open(e)),
                    Err(_) => Err(JoinFailure::PeerOpenTimeout),
                };
                let _ = completions.send(Completion::JoinOpened { pairing: id, result });
            }
        });
        let deadline = tokio::spawn({
            let completions = self.completions_tx.clone();
            async move {
                sleep(join_timeout).await;
                let _ = completions.send(Completion::JoinDeadline { pairing: id });
            }
        });

        if let Some(pairing) = self.table.get_mut(id) {
            pairing.inbound = Some(inbound_rx);
            pairing.track(open);
            pairing.track(deadline);
        }
        self.mode = SessionMode::Joined { host };
        self.publish();
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.mode.is_idle() && self.table.is_empty() {
            debug!("Disconnect requested while idle");
            return;
        }
        info!("Disconnecting {} pairing(s)", self.table.len());
        self.close_all();
        self.notify(Notice::Disconnected);
    }

    fn close_all(&mut self) {
        for id in self.table.ids() {
            self.remove_pairing(id, true);
        }
        self.listener.stop();
        self.mode = SessionMode::Idle;
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Incoming { request, peer } => self.handle_join_request(request, peer),
            TransportEvent::Closed { channel, reason } => match self.table.by_channel(channel) {
                Some(id) => self.teardown(id, TeardownCause::Channel(reason)),
                None => debug!("Ignoring close of unknown channel {}", channel),
            },
        }
    }

    fn handle_join_request(&mut self, request: ChannelHandle, peer: PeerId) {
        if self.mode != SessionMode::Hosting {
            warn!("Rejecting join request from {}: not hosting", peer);
            self.adapter.close(request);
            return;
        }
        if peer == self.identity || !self.presence.admits(&peer) {
            warn!("Rejecting join request from {}: not a room member", peer);
            self.adapter.close(request);
            self.notify(Notice::Rejected { peer });
            return;
        }
        if self.table.len() >= self.config.max_pairings {
            let limit = self.config.max_pairings;
            error!("Join request from {} exceeds the limit of {} pairings", peer, limit);
            self.adapter.close(request);
            self.close_all();
            self.notify(Notice::ResourceExhausted { limit });
            return;
        }

        let id = self.table.insert(peer.clone());
        if !self.table.bind_channel(id, request) {
            warn!("Duplicate join request {} from {}", request, peer);
            self.table.remove(id);
            self.adapter.close(request);
            return;
        }

        let (inbound, inbound_rx) = Inbound::channel(self.config.inbound_queue);
        let handshake = tokio::spawn(host_handshake(
            id,
            request,
            inbound,
            self.config.game_addr(),
            self.config.join_timeout,
            self.adapter.clone(),
            self.completions_tx.clone(),
        ));
        if let Some(pairing) = self.table.get_mut(id) {
            pairing.inbound = Some(inbound_rx);
            pairing.track(handshake);
        }
        info!("{} is joining ({})", peer, id);
        self.publish();
    }

    fn handle_socket(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Data { endpoint, bytes } => {
                let Some(id) = self.table.by_endpoint(endpoint) else {
                    return;
                };
                let Some(pairing) = self.table.get(id) else {
                    return;
                };
                let upstream = pairing.upstream.clone();
                let len = bytes.len();
                let result = match (pairing.state, pairing.channel) {
                    (PairingState::Bridged, Some(channel)) => self.send_upstream(channel, bytes),
                    // The channel is gone; nothing left to send to.
                    _ => Ok(()),
                };
                // Charged by the reader; the transport counts the bytes from here on.
                if let Some(upstream) = upstream {
                    upstream.discharge(len);
                }
                if let Err(e) = result {
                    self.teardown(id, TeardownCause::Send(e));
                }
            }
            SocketEvent::Lost { endpoint, reason } => {
                if let Some(id) = self.table.by_endpoint(endpoint) {
                    self.teardown(id, TeardownCause::Local(reason));
                }
            }
        }
    }

    fn send_upstream(&self, channel: ChannelHandle, bytes: Bytes) -> Result<(), SendError> {
        debug!("{} local bytes to {}", bytes.len(), channel);
        for chunk in self.chunker.split(bytes) {
            if let Err(e) = self.adapter.send(channel, chunk) {
                warn!("Send on {} failed: {}", channel, e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn handle_accepted(&mut self, connection: AcceptedConnection) {
        let waiting = match self.mode {
            SessionMode::Joined { .. } => self
                .table
                .ids()
                .into_iter()
                .find(|id| self.table.get(*id).is_some_and(|p| p.local.endpoint().is_none())),
            _ => None,
        };
        let Some(id) = waiting else {
            warn!("Rejecting local connection from {}: game already connected", connection.addr);
            return;
        };

        info!("Local game connected from {}", connection.addr);
        let local = PendingLocal {
            stream: connection.stream,
            cancel: connection.cancel,
            guard: Some(connection.guard),
        };
        if self.table.attach_local(id, Uuid::new_v4(), local).is_ok() {
            self.try_bridge(id);
            self.publish();
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::HostHandshake { pairing, result } => match result {
                Ok(stream) => {
                    let local = PendingLocal {
                        stream,
                        cancel: self.shutdown.child_token(),
                        guard: None,
                    };
                    if self.table.attach_local(pairing, Uuid::new_v4(), local).is_err() {
                        debug!("{} is gone, dropping its game connection", pairing);
                        return;
                    }
                    self.try_bridge(pairing);
                }
                Err(reason) => self.fail_join(pairing, reason),
            },
            Completion::JoinOpened { pairing, result } => match result {
                Ok(channel) => {
                    if !self.table.bind_channel(pairing, channel) {
                        debug!("Channel {} opened for {} which is gone", channel, pairing);
                        self.adapter.close(channel);
                        return;
                    }
                    info!("Channel {} to the host is open", channel);
                    self.try_bridge(pairing);
                    self.publish();
                }
                Err(reason) => self.fail_join(pairing, reason),
            },
            Completion::JoinDeadline { pairing } => {
                let reason = match self.table.get(pairing) {
                    Some(p) if p.state == PairingState::Connecting => match p.local {
                        LocalSide::Absent => JoinFailure::LocalConnectTimeout,
                        _ => JoinFailure::PeerOpenTimeout,
                    },
                    _ => return,
                };
                self.fail_join(pairing, reason);
            }
            Completion::PeerData { pairing, bytes, queued } => {
                if let Some(LocalSide::Attached(socket)) = self.table.get(pairing).map(|p| &p.local) {
                    socket.send(bytes);
                    let _ = queued.send(());
                }
            }
            Completion::PumpDone { pairing } => {
                let Some(p) = self.table.get_mut(pairing) else {
                    return;
                };
                p.pump_done = true;
                if p.state == PairingState::Closing {
                    debug!("{} drained its channel", pairing);
                    self.finish_closing(pairing);
                }
            }
            Completion::DrainDeadline { pairing } => {
                if self.table.get(pairing).is_some_and(|p| p.state == PairingState::Closing) {
                    warn!("{} did not drain within {:?}", pairing, self.config.teardown_timeout);
                    self.finish_closing(pairing);
                }
            }
        }
    }

    /// Start relaying once both halves of a connecting pairing are present
    fn try_bridge(&mut self, id: PairingId) {
        let Some(pairing) = self.table.get_mut(id) else {
            return;
        };
        let Some(channel) = pairing.channel else {
            return;
        };
        if pairing.state != PairingState::Connecting || !matches!(pairing.local, LocalSide::Pending(..)) {
            return;
        }
        let LocalSide::Pending(endpoint, local) = std::mem::take(&mut pairing.local) else {
            return;
        };

        // Reads wait while the transport is behind on this channel.
        let upstream = self
            .adapter
            .send_backlog(channel)
            .unwrap_or_else(|| Arc::new(Backlog::new()));
        let options = SocketOptions {
            read_chunk: self.chunker.chunk_size(),
            flush_timeout: self.config.teardown_timeout,
            read_gate: Some(ReadGate {
                backlog: upstream.clone(),
                limit: self.config.backlog_threshold,
            }),
        };
        let socket = LocalSocket::spawn(
            endpoint,
            local.stream,
            options,
            local.cancel,
            local.guard,
            self.sockets_tx.clone(),
        );
        let backlog = socket.backlog_handle();
        let game = socket
            .peer_addr()
            .map_or_else(|| "unknown address".to_string(), |addr| addr.to_string());
        pairing.local = LocalSide::Attached(socket);
        pairing.upstream = Some(upstream);
        pairing.state = PairingState::Bridged;
        pairing.latency = self.adapter.latency(channel);
        pairing.relay = self.adapter.relay_descriptor(channel);

        if let Some(inbound) = pairing.inbound.take() {
            let pump = tokio::spawn(pump_channel(
                id,
                inbound,
                backlog,
                self.config.backlog_threshold,
                self.completions_tx.clone(),
            ));
            pairing.track(pump);
        }
        info!(
            "{} bridged: endpoint {} ({}) <-> channel {} ({})",
            pairing.peer, endpoint, game, channel, id
        );
        self.publish();
    }

    fn teardown(&mut self, id: PairingId, cause: TeardownCause) {
        if let TeardownCause::Channel(reason) = &cause {
            if self.start_closing(id, cause.clone()) {
                debug!("{} closing ({}), draining what the channel delivered", id, reason);
                return;
            }
        }
        // A pairing already closing keeps the cause that started it.
        let cause = self
            .table
            .get_mut(id)
            .and_then(|pairing| pairing.closing.take())
            .unwrap_or(cause);
        let close_channel = !matches!(cause, TeardownCause::Channel(_));
        if let Some(peer) = self.remove_pairing(id, close_channel) {
            info!("Pairing {} with {} closed: {}", id, peer, cause);
            self.notify(Notice::PairingClosed { peer, cause });
        }
    }

    /// Hold a bridged pairing open until its pump has written out everything
    /// the closed channel delivered, bounded by the teardown timeout. `false`
    /// when there is nothing to wait for.
    fn start_closing(&mut self, id: PairingId, cause: TeardownCause) -> bool {
        let Some(pairing) = self.table.get_mut(id) else {
            return false;
        };
        if pairing.state != PairingState::Bridged || pairing.pump_done {
            return false;
        }
        pairing.state = PairingState::Closing;
        pairing.closing = Some(cause);

        let completions = self.completions_tx.clone();
        let teardown_timeout = self.config.teardown_timeout;
        pairing.track(tokio::spawn(async move {
            sleep(teardown_timeout).await;
            let _ = completions.send(Completion::DrainDeadline { pairing: id });
        }));
        self.publish();
        true
    }

    fn finish_closing(&mut self, id: PairingId) {
        let cause = self.table.get_mut(id).and_then(|pairing| pairing.closing.take());
        if let Some(cause) = cause {
            self.teardown(id, cause);
        }
    }

    fn fail_join(&mut self, id: PairingId, reason: JoinFailure) {
        if let Some(peer) = self.remove_pairing(id, true) {
            warn!("Join with {} failed: {}", peer, reason);
            self.notify(Notice::JoinFailed { peer, reason });
        }
    }

    /// Drop a pairing and close whatever is left of it. A joiner has only one
    /// pairing, so losing it returns the session to idle.
    fn remove_pairing(&mut self, id: PairingId, close_channel: bool) -> Option<PeerId> {
        let mut pairing = self.table.remove(id)?;
        pairing.state = PairingState::Closing;
        if let LocalSide::Attached(socket) = &pairing.local {
            socket.close();
        }
        if close_channel {
            if let Some(channel) = pairing.channel {
                self.adapter.close(channel);
            }
        }
        pairing.state = PairingState::Closed;
        let peer = pairing.peer.clone();
        drop(pairing);

        if matches!(self.mode, SessionMode::Joined { .. }) {
            self.listener.stop();
            self.mode = SessionMode::Idle;
        }
        Some(peer)
    }

    fn refresh_diagnostics(&mut self) {
        for pairing in self.table.iter_mut() {
            if pairing.state != PairingState::Bridged {
                continue;
            }
            if let Some(channel) = pairing.channel {
                pairing.latency = self.adapter.latency(channel);
                pairing.relay = self.adapter.relay_descriptor(channel);
            }
        }
        self.publish();
    }

    fn notify(&mut self, notice: Notice) {
        self.last_notice = Some(notice);
        self.notice_seq += 1;
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.status.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn snapshot(&self) -> SessionStatus {
        let members = self.presence.members();
        let rank = |peer: &PeerId| members.iter().position(|m| m == peer).unwrap_or(usize::MAX);

        let mut rows: Vec<(usize, PeerStatus)> = self
            .table
            .iter()
            .filter(|pairing| pairing.peer != self.identity)
            .map(|pairing| {
                let row = PeerStatus {
                    peer: pairing.peer.clone(),
                    pairing: pairing.id,
                    state: pairing.state,
                    latency_ms: pairing.latency.map(|rtt| rtt.as_millis() as u64),
                    relay: pairing.relay.clone(),
                    backlog_bytes: pairing.backlog(),
                };
                (rank(&pairing.peer), row)
            })
            .collect();
        rows.sort_by_key(|(order, row)| (*order, row.pairing));

        SessionStatus {
            mode: self.mode.clone(),
            active_local_connections: self.table.iter().filter(|p| p.local.is_live()).count(),
            listen_addr: self.listener.local_addr(),
            peers: rows.into_iter().map(|(_, row)| row).collect(),
            last_notice: self.last_notice.clone(),
            notice_seq: self.notice_seq,
        }
    }
}

/// Connect to the game and accept the channel at the same time; the first
/// failure cancels the other half.
async fn host_handshake(
    pairing: PairingId,
    request: ChannelHandle,
    inbound: Inbound,
    game_addr: SocketAddr,
    join_timeout: Duration,
    adapter: Arc<dyn PeerChannelAdapter>,
    completions: mpsc::UnboundedSender<Completion>,
) {
    let connect = async {
        match timeout(join_timeout, TcpStream::connect(game_addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(JoinFailure::LocalConnect(e.kind())),
            Err(_) => Err(JoinFailure::LocalConnectTimeout),
        }
    };
    let accept = async {
        match timeout(join_timeout, adapter.accept(request, inbound)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(JoinFailure::Open(e)),
            Err(_) => Err(JoinFailure::PeerOpenTimeout),
        }
    };

    let result = tokio::try_join!(connect, accept).map(|(stream, ())| stream);
    let _ = completions.send(Completion::HostHandshake { pairing, result });
}

/// Move channel messages to the local socket, holding back while its write
/// backlog is over `threshold`.
async fn pump_channel(
    pairing: PairingId,
    mut inbound: mpsc::Receiver<Bytes>,
    backlog: Arc<Backlog>,
    threshold: usize,
    completions: mpsc::UnboundedSender<Completion>,
) {
    while let Some(bytes) = inbound.recv().await {
        if !backlog.wait_for_room(bytes.len(), threshold).await {
            break;
        }
        let (queued, ack) = oneshot::channel();
        if completions
            .send(Completion::PeerData { pairing, bytes, queued })
            .is_err()
        {
            break;
        }
        if ack.await.is_err() {
            break;
        }
    }
    debug!("Inbound pump for {} exited", pairing);
    let _ = completions.send(Completion::PumpDone { pairing });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::StaticRoom;
    use crate::transport::{MemoryNetwork, OpenError};

    fn joiner_config() -> BridgeConfig {
        BridgeConfig {
            listen_port: 0,
            join_timeout: Duration::from_millis(500),
            ..BridgeConfig::default()
        }
    }

    async fn wait_for(
        session: &BridgeSession,
        mut done: impl FnMut(&SessionStatus) -> bool,
    ) -> SessionStatus {
        let mut rx = session.subscribe();
        timeout(Duration::from_secs(5), async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if done(&status) {
                        return status.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn only_one_role_at_a_time() {
        let network = MemoryNetwork::new();
        let session = BridgeSession::spawn(
            BridgeConfig::default(),
            Arc::new(network.transport("host")),
            Arc::new(StaticRoom::open(PeerId::new("host"))),
        )
        .unwrap();

        session.start_hosting().await.unwrap();
        assert_eq!(session.start_hosting().await, Err(SessionError::AlreadyActive));
        assert_eq!(session.join_host(PeerId::new("other")).await, Err(JoinError::AlreadyActive));
        assert_eq!(session.status().mode, SessionMode::Hosting);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let network = MemoryNetwork::new();
        let session = BridgeSession::spawn(
            BridgeConfig::default(),
            Arc::new(network.transport("host")),
            Arc::new(StaticRoom::open(PeerId::new("host"))),
        )
        .unwrap();

        session.disconnect().await;
        assert_eq!(session.status().notice_seq, 0);

        session.start_hosting().await.unwrap();
        session.disconnect().await;
        session.disconnect().await;

        let status = session.status();
        assert_eq!(status.mode, SessionMode::Idle);
        assert_eq!(status.last_notice, Some(Notice::Disconnected));
        assert_eq!(status.notice_seq, 1);

        // Idle again, so hosting can start over.
        session.start_hosting().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_host_fails_the_join() {
        let network = MemoryNetwork::new();
        let session = BridgeSession::spawn(
            joiner_config(),
            Arc::new(network.transport("p1")),
            Arc::new(StaticRoom::open(PeerId::new("p1"))),
        )
        .unwrap();

        session.join_host(PeerId::new("ghost")).await.unwrap();
        let status = wait_for(&session, |s| s.last_notice.is_some()).await;

        assert_eq!(
            status.last_notice,
            Some(Notice::JoinFailed {
                peer: PeerId::new("ghost"),
                reason: JoinFailure::Open(OpenError::Unreachable("ghost".to_string())),
            })
        );
        assert_eq!(status.mode, SessionMode::Idle);
        assert!(status.listen_addr.is_none());
        assert!(status.peers.is_empty());
    }

    #[tokio::test]
    async fn strangers_are_rejected_by_the_host() {
        let network = MemoryNetwork::new();
        let host = BridgeSession::spawn(
            BridgeConfig::default(),
            Arc::new(network.transport("host")),
            Arc::new(StaticRoom::new(PeerId::new("host"), vec![PeerId::new("friend")])),
        )
        .unwrap();
        host.start_hosting().await.unwrap();

        let stranger = BridgeSession::spawn(
            joiner_config(),
            Arc::new(network.transport("stranger")),
            Arc::new(StaticRoom::open(PeerId::new("stranger"))),
        )
        .unwrap();
        stranger.join_host(PeerId::new("host")).await.unwrap();

        let status = wait_for(&stranger, |s| s.last_notice.is_some()).await;
        assert!(matches!(
            status.last_notice,
            Some(Notice::JoinFailed { reason: JoinFailure::Open(OpenError::Rejected), .. })
        ));

        let status = wait_for(&host, |s| s.last_notice.is_some()).await;
        assert_eq!(status.last_notice, Some(Notice::Rejected { peer: PeerId::new("stranger") }));
        assert!(status.peers.is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let network = MemoryNetwork::new();
        let config = BridgeConfig { max_pairings: 0, ..BridgeConfig::default() };
        let result = BridgeSession::spawn(
            config,
            Arc::new(network.transport("host")),
            Arc::new(StaticRoom::open(PeerId::new("host"))),
        );
        assert!(matches!(result, Err(ConfigError::ZeroPairings)));
    }
}
