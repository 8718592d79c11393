//! Room membership as seen by the bridge.

use std::sync::RwLock;

use crate::transport::PeerId;

/// Who is in the room. Owned by the room service; the bridge only reads it.
pub trait Presence: Send + Sync + 'static {
    fn current_identity(&self) -> PeerId;

    /// Room members in display order
    fn members(&self) -> Vec<PeerId>;

    /// Whether a join request from `peer` should be served
    fn admits(&self, peer: &PeerId) -> bool {
        self.members().contains(peer)
    }
}

/// Fixed or self-populating member list for running without a room service
#[derive(Debug)]
pub struct StaticRoom {
    identity: PeerId,
    members: RwLock<Vec<PeerId>>,
    open: bool,
}

impl StaticRoom {
    /// Only the listed members are admitted
    pub fn new(identity: PeerId, members: Vec<PeerId>) -> Self {
        Self {
            identity,
            members: RwLock::new(members),
            open: false,
        }
    }

    /// Anyone is admitted and becomes a member on first contact
    pub fn open(identity: PeerId) -> Self {
        Self {
            identity,
            members: RwLock::new(Vec::new()),
            open: true,
        }
    }

    pub fn add_member(&self, peer: PeerId) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        if !members.contains(&peer) {
            members.push(peer);
        }
    }

    pub fn remove_member(&self, peer: &PeerId) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        members.retain(|member| member != peer);
    }
}

impl Presence for StaticRoom {
    fn current_identity(&self) -> PeerId {
        self.identity.clone()
    }

    fn members(&self) -> Vec<PeerId> {
        self.members.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn admits(&self, peer: &PeerId) -> bool {
        if self.open {
            self.add_member(peer.clone());
            return true;
        }
        self.members().contains(peer)
    }
}
