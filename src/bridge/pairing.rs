use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::TeardownCause;
use super::status::PairingState;
use crate::local::{ActiveGuard, EndpointId, LocalSocket};
use crate::transport::{ChannelHandle, PeerId};
use crate::utils::Backlog;

/// Opaque id of one pairing inside the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairingId(u64);

impl PairingId {
    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PairingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pairing-{}", self.0)
    }
}

/// A local connection that has not been started yet
#[derive(Debug)]
pub(crate) struct PendingLocal {
    pub stream: TcpStream,
    pub cancel: CancellationToken,
    pub guard: Option<ActiveGuard>,
}

#[derive(Debug, Default)]
pub(crate) enum LocalSide {
    #[default]
    Absent,
    Pending(EndpointId, PendingLocal),
    Attached(LocalSocket),
}

impl LocalSide {
    pub fn endpoint(&self) -> Option<EndpointId> {
        match self {
            LocalSide::Absent => None,
            LocalSide::Pending(id, _) => Some(*id),
            LocalSide::Attached(socket) => Some(socket.id()),
        }
    }

    pub fn is_live(&self) -> bool {
        match self {
            LocalSide::Absent => false,
            LocalSide::Pending(..) => true,
            LocalSide::Attached(socket) => !socket.is_closed(),
        }
    }
}

/// One local endpoint bridged (or being bridged) to one peer channel
#[derive(Debug)]
pub(crate) struct Pairing {
    pub id: PairingId,
    pub peer: PeerId,
    pub state: PairingState,
    pub channel: Option<ChannelHandle>,
    pub local: LocalSide,
    /// Channel messages waiting for the pump; taken when bridged
    pub inbound: Option<mpsc::Receiver<Bytes>>,
    /// Local bytes read but not yet delivered by the transport
    pub upstream: Option<Arc<Backlog>>,
    /// The pump has posted everything it will ever post
    pub pump_done: bool,
    /// Set while `Closing`: the cause reported once the pump drains
    pub closing: Option<TeardownCause>,
    pub latency: Option<Duration>,
    pub relay: String,
    tasks: Vec<JoinHandle<()>>,
}

impl Pairing {
    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(task);
    }

    pub fn backlog(&self) -> usize {
        match &self.local {
            LocalSide::Attached(socket) => socket.backlog(),
            _ => 0,
        }
    }
}

impl Drop for Pairing {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Arena of pairings with 1:1 indices from endpoints and channels
#[derive(Debug, Default)]
pub(crate) struct PairingTable {
    next_id: u64,
    pairings: HashMap<PairingId, Pairing>,
    by_endpoint: HashMap<EndpointId, PairingId>,
    by_channel: HashMap<ChannelHandle, PairingId>,
}

impl PairingTable {
    pub fn insert(&mut self, peer: PeerId) -> PairingId {
        self.next_id += 1;
        let id = PairingId(self.next_id);
        self.pairings.insert(
            id,
            Pairing {
                id,
                peer,
                state: PairingState::Connecting,
                channel: None,
                local: LocalSide::Absent,
                inbound: None,
                upstream: None,
                pump_done: false,
                closing: None,
                latency: None,
                relay: "N/A".to_string(),
                tasks: Vec::new(),
            },
        );
        id
    }

    pub fn get(&self, id: PairingId) -> Option<&Pairing> {
        self.pairings.get(&id)
    }

    pub fn get_mut(&mut self, id: PairingId) -> Option<&mut Pairing> {
        self.pairings.get_mut(&id)
    }

    /// Bind `channel` to `id`. Fails if either side is already bound.
    pub fn bind_channel(&mut self, id: PairingId, channel: ChannelHandle) -> bool {
        if self.by_channel.contains_key(&channel) {
            return false;
        }
        let Some(pairing) = self.pairings.get_mut(&id) else {
            return false;
        };
        if pairing.channel.is_some() {
            return false;
        }
        pairing.channel = Some(channel);
        self.by_channel.insert(channel, id);
        true
    }

    /// Attach a not-yet-started local connection. Fails if one is already attached.
    pub fn attach_local(&mut self, id: PairingId, endpoint: EndpointId, local: PendingLocal) -> Result<(), PendingLocal> {
        if self.by_endpoint.contains_key(&endpoint) {
            return Err(local);
        }
        let Some(pairing) = self.pairings.get_mut(&id) else {
            return Err(local);
        };
        if !matches!(pairing.local, LocalSide::Absent) {
            return Err(local);
        }
        pairing.local = LocalSide::Pending(endpoint, local);
        self.by_endpoint.insert(endpoint, id);
        Ok(())
    }

    pub fn by_channel(&self, channel: ChannelHandle) -> Option<PairingId> {
        self.by_channel.get(&channel).copied()
    }

    pub fn by_endpoint(&self, endpoint: EndpointId) -> Option<PairingId> {
        self.by_endpoint.get(&endpoint).copied()
    }

    /// Remove a pairing together with both of its index entries
    pub fn remove(&mut self, id: PairingId) -> Option<Pairing> {
        let pairing = self.pairings.remove(&id)?;
        if let Some(channel) = pairing.channel {
            self.by_channel.remove(&channel);
        }
        if let Some(endpoint) = pairing.local.endpoint() {
            self.by_endpoint.remove(&endpoint);
        }
        Some(pairing)
    }

    pub fn ids(&self) -> Vec<PairingId> {
        let mut ids: Vec<PairingId> = self.pairings.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pairing> {
        self.pairings.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pairing> {
        self.pairings.values_mut()
    }

    pub fn len(&self) -> usize {
        self.pairings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairings.is_empty()
    }

    /// Every index entry points at a live pairing that points back at it
    pub fn is_consistent(&self) -> bool {
        let channels_ok = self.by_channel.iter().all(|(channel, id)| {
            self.pairings.get(id).is_some_and(|p| p.channel == Some(*channel))
        });
        let endpoints_ok = self.by_endpoint.iter().all(|(endpoint, id)| {
            self.pairings.get(id).is_some_and(|p| p.local.endpoint() == Some(*endpoint))
        });
        let bound_channels = self.pairings.values().filter(|p| p.channel.is_some()).count();
        let bound_endpoints = self.pairings.values().filter(|p| p.local.endpoint().is_some()).count();

        channels_ok
            && endpoints_ok
            && bound_channels == self.by_channel.len()
            && bound_endpoints == self.by_endpoint.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    async fn pending_local() -> PendingLocal {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        PendingLocal {
            stream,
            cancel: CancellationToken::new(),
            guard: None,
        }
    }

    #[test]
    fn channels_bind_one_to_one() {
        let mut table = PairingTable::default();
        let a = table.insert(PeerId::new("a"));
        let b = table.insert(PeerId::new("b"));

        assert!(table.bind_channel(a, ChannelHandle(1)));
        assert!(!table.bind_channel(b, ChannelHandle(1)));
        assert!(!table.bind_channel(a, ChannelHandle(2)));
        assert!(table.bind_channel(b, ChannelHandle(2)));

        assert_eq!(table.by_channel(ChannelHandle(1)), Some(a));
        assert_eq!(table.by_channel(ChannelHandle(2)), Some(b));
        assert!(table.is_consistent());
    }

    #[tokio::test]
    async fn remove_drops_both_indices() {
        let mut table = PairingTable::default();
        let id = table.insert(PeerId::new("a"));
        let endpoint = Uuid::new_v4();

        assert!(table.bind_channel(id, ChannelHandle(7)));
        assert!(table.attach_local(id, endpoint, pending_local().await).is_ok());
        assert!(table.attach_local(id, Uuid::new_v4(), pending_local().await).is_err());
        assert_eq!(table.by_endpoint(endpoint), Some(id));

        let removed = table.remove(id).unwrap();
        assert_eq!(removed.peer, PeerId::new("a"));
        assert!(table.remove(id).is_none());
        assert_eq!(table.by_endpoint(endpoint), None);
        assert_eq!(table.by_channel(ChannelHandle(7)), None);
        assert!(table.is_empty());
        assert!(table.is_consistent());
    }

    #[tokio::test]
    async fn dropping_a_pairing_aborts_its_tasks() {
        let mut table = PairingTable::default();
        let id = table.insert(PeerId::new("a"));
        let task = tokio::spawn(std::future::pending::<()>());
        let abort = task.abort_handle();
        table.get_mut(id).unwrap().track(task);

        drop(table.remove(id));
        tokio::time::timeout(Duration::from_secs(1), async {
            while !abort.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let mut table = PairingTable::default();
        let first = table.insert(PeerId::new("a"));
        let second = table.insert(PeerId::new("a"));
        assert_ne!(first, second);
        assert_eq!(table.ids(), vec![first, second]);
        assert_eq!(table.len(), 2);
    }
}
