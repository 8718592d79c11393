use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::utils::back_off_accept;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("permission denied binding port {0}")]
    PermissionDenied(u16),

    #[error("failed to bind port {port}: {kind:?}")]
    Io { port: u16, kind: io::ErrorKind },
}

impl BindError {
    fn from_io(port: u16, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => BindError::PortInUse(port),
            io::ErrorKind::PermissionDenied => BindError::PermissionDenied(port),
            kind => BindError::Io { port, kind },
        }
    }
}

/// Counts one accepted connection for as long as it is alive
#[derive(Debug)]
pub struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A local connection accepted by the listener, not yet started
#[derive(Debug)]
pub struct AcceptedConnection {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    /// Cancelled when the listener stops
    pub cancel: CancellationToken,
    pub guard: ActiveGuard,
}

/// Accepts local game connections on one port
#[derive(Debug)]
pub struct LocalListener {
    bind_ip: IpAddr,
    local_addr: Option<SocketAddr>,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl LocalListener {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            local_addr: None,
            active: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Bind `port` and start accepting; each connection is posted to `accepted`.
    pub async fn start(
        &mut self,
        port: u16,
        accepted: mpsc::UnboundedSender<AcceptedConnection>,
    ) -> Result<(), BindError> {
        if self.local_addr.is_some() {
            self.stop();
        }

        let addr = SocketAddr::new(self.bind_ip, port);
        debug!("Binding local listener to {}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BindError::from_io(port, &e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::from_io(port, &e))?;
        info!("Local listener bound to {}", local_addr);

        self.cancel = CancellationToken::new();
        self.local_addr = Some(local_addr);

        let cancel = self.cancel.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = listener.accept() => result,
                };

                match result {
                    Ok((stream, addr)) => {
                        debug!("Accepted local connection from {}", addr);
                        active.fetch_add(1, Ordering::AcqRel);
                        let connection = AcceptedConnection {
                            stream,
                            addr,
                            cancel: cancel.child_token(),
                            guard: ActiveGuard { active: active.clone() },
                        };
                        if accepted.send(connection).is_err() {
                            debug!("Accept sink closed, stopping listener");
                            break;
                        }
                    }
                    Err(e) => back_off_accept("local connection", &e).await,
                }
            }
            debug!("Accept loop for {} exited", local_addr);
        });

        Ok(())
    }

    /// Stop accepting and close every connection this listener produced.
    pub fn stop(&mut self) {
        if let Some(addr) = self.local_addr.take() {
            info!("Stopping local listener on {}", addr);
            self.cancel.cancel();
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Accepted connections that are still alive
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn accepts_and_counts_connections() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = LocalListener::new(loopback());
        listener.start(0, tx).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let accepted = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(listener.active_count(), 1);

        drop(accepted);
        assert_eq!(listener.active_count(), 0);
    }

    #[tokio::test]
    async fn port_in_use_is_reported() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut listener = LocalListener::new(loopback());
        assert_eq!(listener.start(port, tx).await, Err(BindError::PortInUse(port)));
        assert!(listener.local_addr().is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_cancels_connections() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = LocalListener::new(loopback());
        listener.start(0, tx).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let accepted = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();

        listener.stop();
        listener.stop();
        assert!(accepted.cancel.is_cancelled());
        assert!(listener.local_addr().is_none());
    }

    #[test]
    fn io_errors_map_to_bind_errors() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(BindError::from_io(80, &denied), BindError::PermissionDenied(80));

        let other = io::Error::from(io::ErrorKind::AddrNotAvailable);
        assert_eq!(
            BindError::from_io(80, &other),
            BindError::Io { port: 80, kind: io::ErrorKind::AddrNotAvailable }
        );
    }
}
