use super::config::{MAX_FAILURES, NODE_GOOD_WINDOW};
use super::node_id::{NodeId, ID_LEN};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

/// Length of a compact IPv4 node record: id, address, port.
pub const COMPACT_NODE_LEN: usize = ID_LEN + 6;
/// Length of a compact IPv4 peer record: address, port.
pub const COMPACT_PEER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Never heard from.
    Unknown,
    Good,
    Questionable,
    Bad,
}

/// A remote DHT participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    last_seen: Option<Instant>,
    failures: u8,
    pub(crate) currently_pinging: bool,
    token: Option<Bytes>,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: None,
            failures: 0,
            currently_pinging: false,
            token: None,
        }
    }

    /// Records a message received from this node.
    pub fn seen(&mut self, now: Instant) {
        self.last_seen = Some(now);
        self.failures = 0;
    }

    /// Records an unanswered query.
    pub fn failed(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    pub fn failures(&self) -> u8 {
        self.failures
    }

    pub fn state(&self, now: Instant) -> NodeState {
        if self.failures >= MAX_FAILURES {
            return NodeState::Bad;
        }
        if self.failures > 0 {
            return NodeState::Questionable;
        }
        match self.last_seen {
            None => NodeState::Unknown,
            Some(seen) if now.saturating_duration_since(seen) < NODE_GOOD_WINDOW => NodeState::Good,
            Some(_) => NodeState::Questionable,
        }
    }

    pub fn token(&self) -> Option<&Bytes> {
        self.token.as_ref()
    }

    pub fn set_token(&mut self, token: Bytes) {
        self.token = Some(token);
    }

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..ID_LEN]).ok()?;
        let addr = decode_compact_peer(&data[ID_LEN..])?;
        Some(Self::new(id, addr))
    }

    /// IPv6 nodes have no compact IPv4 form.
    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let peer = encode_compact_peer(&self.addr)?;
        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..ID_LEN].copy_from_slice(self.id.as_bytes());
        compact[ID_LEN..].copy_from_slice(&peer);
        Some(compact)
    }
}

/// Decodes a concatenated compact node list, skipping a trailing partial record.
pub fn decode_compact_nodes(data: &[u8]) -> Vec<Node> {
    data.chunks_exact(COMPACT_NODE_LEN)
        .filter_map(Node::from_compact)
        .collect()
}

pub fn encode_compact_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Bytes {
    let compact: Vec<u8> = nodes
        .into_iter()
        .filter_map(Node::to_compact)
        .flatten()
        .collect();
    Bytes::from(compact)
}

pub fn decode_compact_peer(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

pub fn encode_compact_peer(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => Some(compact_v4(v4)),
        SocketAddr::V6(_) => None,
    }
}

fn compact_v4(addr: &SocketAddrV4) -> [u8; COMPACT_PEER_LEN] {
    let mut data = [0u8; COMPACT_PEER_LEN];
    data[..4].copy_from_slice(&addr.ip().octets());
    data[4..].copy_from_slice(&addr.port().to_be_bytes());
    data
}
