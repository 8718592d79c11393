use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::listener::ActiveGuard;
use crate::utils::Backlog;

/// Unique identifier for a local endpoint
pub type EndpointId = Uuid;

/// Why a local connection went away
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionLost {
    #[error("local peer closed the connection")]
    Eof,

    #[error("read failed: {0:?}")]
    Read(io::ErrorKind),

    #[error("write failed: {0:?}")]
    Write(io::ErrorKind),

    #[error("connection cancelled by its listener")]
    Cancelled,
}

/// Notifications posted by a local socket to its owner
#[derive(Debug)]
pub enum SocketEvent {
    Data { endpoint: EndpointId, bytes: Bytes },
    Lost { endpoint: EndpointId, reason: ConnectionLost },
}

/// Holds reads back while whatever consumes them is behind
#[derive(Debug, Clone)]
pub struct ReadGate {
    pub backlog: Arc<Backlog>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Largest chunk handed to the owner in one `Data` event
    pub read_chunk: usize,
    /// How long `close` may spend writing out what is queued
    pub flush_timeout: Duration,
    /// Each chunk read is charged here; reading waits while it is over its limit
    pub read_gate: Option<ReadGate>,
}

/// Asynchronous byte I/O on one local TCP connection
#[derive(Debug)]
pub struct LocalSocket {
    id: EndpointId,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Bytes>,
    backlog: Arc<Backlog>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl LocalSocket {
    /// Start the reader and writer tasks for `stream`.
    ///
    /// Received chunks and the single loss notification are posted to `events`.
    pub fn spawn(
        id: EndpointId,
        stream: TcpStream,
        options: SocketOptions,
        cancel: CancellationToken,
        guard: Option<ActiveGuard>,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on endpoint {}: {}", id, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let backlog = Arc::new(Backlog::new());
        let finished = Arc::new(AtomicBool::new(false));
        // Released once both tasks are done with the connection.
        let guard = Arc::new(guard);

        let reporter = LossReporter {
            endpoint: id,
            finished: finished.clone(),
            events: events.clone(),
        };
        let SocketOptions {
            read_chunk,
            flush_timeout,
            read_gate,
        } = options;

        tokio::spawn({
            let reporter = reporter.clone();
            let cancel = cancel.clone();
            let guard = guard.clone();
            async move {
                let reader = Reader {
                    id,
                    read_chunk,
                    gate: read_gate,
                    cancel: &cancel,
                    reporter: &reporter,
                    events: &events,
                };
                reader.run(read_half).await;
                debug!("Reader for endpoint {} exited", id);
                drop(guard);
            }
        });

        tokio::spawn({
            let backlog = backlog.clone();
            let cancel = cancel.clone();
            async move {
                if let Err(e) = write_loop(write_half, rx, &backlog, &cancel, flush_timeout).await {
                    reporter.report(ConnectionLost::Write(e.kind()));
                }
                backlog.close();
                // Take the reader down with us.
                cancel.cancel();
                debug!("Writer for endpoint {} exited", id);
                drop(guard);
            }
        });

        Self {
            id,
            peer_addr,
            outbound: tx,
            backlog,
            cancel,
            finished,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue bytes for writing. Never blocks; silently dropped once closed.
    pub fn send(&self, bytes: Bytes) {
        if self.finished.load(Ordering::Acquire) || bytes.is_empty() {
            return;
        }
        let len = bytes.len();
        self.backlog.charge(len);
        if self.outbound.send(bytes).is_err() {
            self.backlog.discharge(len);
        }
    }

    /// Bytes queued but not yet written
    pub fn backlog(&self) -> usize {
        self.backlog.pending()
    }

    pub fn backlog_handle(&self) -> Arc<Backlog> {
        self.backlog.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Close the connection after flushing what is queued.
    ///
    /// Returns `true` only for the call that actually closed it; no loss is
    /// reported for an explicit close.
    pub fn close(&self) -> bool {
        let first = !self.finished.swap(true, Ordering::AcqRel);
        if first {
            debug!("Closing endpoint {}", self.id);
            self.cancel.cancel();
        }
        first
    }
}

impl Drop for LocalSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone)]
struct LossReporter {
    endpoint: EndpointId,
    finished: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl LossReporter {
    fn report(&self, reason: ConnectionLost) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Endpoint {} lost: {}", self.endpoint, reason);
        let _ = self.events.send(SocketEvent::Lost {
            endpoint: self.endpoint,
            reason,
        });
    }
}

struct Reader<'a> {
    id: EndpointId,
    read_chunk: usize,
    gate: Option<ReadGate>,
    cancel: &'a CancellationToken,
    reporter: &'a LossReporter,
    events: &'a mpsc::UnboundedSender<SocketEvent>,
}

impl Reader<'_> {
    async fn run(&self, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; self.read_chunk.max(1)];

        loop {
            if !self.wait_for_gate(buf.len()).await {
                return;
            }
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.reporter.report(ConnectionLost::Cancelled);
                    return;
                }
                result = read_half.read(&mut buf) => result,
            };

            match result {
                Ok(0) => {
                    self.reporter.report(ConnectionLost::Eof);
                    return;
                }
                Ok(n) => {
                    if let Some(gate) = &self.gate {
                        gate.backlog.charge(n);
                    }
                    let bytes = Bytes::copy_from_slice(&buf[..n]);
                    let event = SocketEvent::Data { endpoint: self.id, bytes };
                    if self.events.send(event).is_err() {
                        warn!("Owner of endpoint {} is gone, dropping connection", self.id);
                        return;
                    }
                }
                Err(e) => {
                    self.reporter.report(ConnectionLost::Read(e.kind()));
                    return;
                }
            }
        }
    }

    /// `false` when the reader should stop
    async fn wait_for_gate(&self, incoming: usize) -> bool {
        let Some(gate) = &self.gate else {
            return true;
        };
        let admitted = tokio::select! {
            _ = self.cancel.cancelled() => false,
            admitted = gate.backlog.wait_for_room(incoming, gate.limit) => admitted,
        };
        if !admitted {
            // Nowhere left to send to; the owner closes us.
            debug!("Reads on endpoint {} stopped", self.id);
            self.cancel.cancelled().await;
            self.reporter.report(ConnectionLost::Cancelled);
        }
        admitted
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    backlog: &Backlog,
    cancel: &CancellationToken,
    flush_timeout: Duration,
) -> io::Result<()> {
    let mut current = Bytes::new();
    let mut current_len = 0;

    loop {
        if current.is_empty() {
            if current_len > 0 {
                backlog.discharge(current_len);
                current_len = 0;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(bytes) => {
                        current_len = bytes.len();
                        current = bytes;
                    }
                    None => break,
                },
            }
        } else {
            // `write_all_buf` advances `current` even when interrupted.
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = write_half.write_all_buf(&mut current) => result?,
            }
        }
    }

    rx.close();
    let flush = async {
        loop {
            write_half.write_all_buf(&mut current).await?;
            if current_len > 0 {
                backlog.discharge(current_len);
                current_len = 0;
            }
            match rx.recv().await {
                Some(bytes) => {
                    current_len = bytes.len();
                    current = bytes;
                }
                None => break,
            }
        }
        write_half.shutdown().await
    };

    match timeout(flush_timeout, flush).await {
        Ok(result) => result,
        Err(_) => {
            debug!("Flush timed out after {:?}, abandoning queued bytes", flush_timeout);
            Ok(())
        }
    }
}
