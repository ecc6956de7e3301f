//! Known peers keyed by identity, with connected/disconnected status.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use parking_lot::Mutex;

/// A remote device reachable at `ip_address:port`. `identity` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub identity: String,
    pub ip_address: IpAddr,
    pub port: u16,
    pub connected: bool,
}

impl Peer {
    pub fn new(identity: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            identity: identity.into(),
            ip_address: addr.ip(),
            port: addr.port(),
            connected: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.port)
    }
}

/// Result of [`PeerRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    /// Identity known; address or port changed.
    Updated,
    Unchanged,
}

/// Thread-safe identity -> Peer map. Every mutation takes the single lock for its own duration only.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<String, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new peer or update the address of a known one.
    /// The stored `connected` flag is kept; use [`mark_connected`](Self::mark_connected) to change it.
    pub fn upsert(&self, peer: Peer) -> Upsert {
        let mut peers = self.peers.lock();
        match peers.get_mut(&peer.identity) {
            Some(existing) => {
                if existing.ip_address == peer.ip_address && existing.port == peer.port {
                    Upsert::Unchanged
                } else {
                    existing.ip_address = peer.ip_address;
                    existing.port = peer.port;
                    Upsert::Updated
                }
            }
            None => {
                peers.insert(peer.identity.clone(), peer);
                Upsert::Inserted
            }
        }
    }

    pub fn remove(&self, identity: &str) -> Option<Peer> {
        self.peers.lock().remove(identity)
    }

    /// Returns false if the identity is unknown.
    pub fn mark_connected(&self, identity: &str, connected: bool) -> bool {
        match self.peers.lock().get_mut(identity) {
            Some(peer) => {
                peer.connected = connected;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, identity: &str) -> Option<Peer> {
        self.peers.lock().get(identity).cloned()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.peers.lock().contains_key(identity)
    }

    /// Snapshot of every peer, ordered by identity. Safe to iterate while discovery keeps mutating.
    pub fn all(&self) -> Vec<Peer> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    pub fn clear(&self) {
        self.peers.lock().clear();
    }
}
