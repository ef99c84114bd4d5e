use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::node_id::NodeId;

struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

/// Peers other nodes announced to us, served back from get_peers.
pub struct PeerStore {
    peers: HashMap<NodeId, Vec<AnnouncedPeer>>,
    lifetime: Duration,
    max_per_info_hash: usize,
}

impl PeerStore {
    pub fn new(lifetime: Duration, max_per_info_hash: usize) -> Self {
        Self {
            peers: HashMap::new(),
            lifetime,
            max_per_info_hash,
        }
    }

    pub fn add_peer(&mut self, info_hash: NodeId, addr: SocketAddr, now: Instant) {
        let lifetime = self.lifetime;
        let peers = self.peers.entry(info_hash).or_default();
        peers.retain(|p| {
            now.saturating_duration_since(p.announced_at) < lifetime && p.addr != addr
        });

        if peers.len() < self.max_per_info_hash {
            peers.push(AnnouncedPeer {
                addr,
                announced_at: now,
            });
        }
    }

    pub fn get_peers(&mut self, info_hash: &NodeId, now: Instant) -> Vec<SocketAddr> {
        let lifetime = self.lifetime;
        match self.peers.get_mut(info_hash) {
            Some(peers) => {
                peers.retain(|p| now.saturating_duration_since(p.announced_at) < lifetime);
                peers.iter().map(|p| p.addr).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drops expired entries and info-hashes left with none.
    pub fn expire(&mut self, now: Instant) {
        let lifetime = self.lifetime;
        self.peers.retain(|_, peers| {
            peers.retain(|p| now.saturating_duration_since(p.announced_at) < lifetime);
            !peers.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.peers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
