use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use super::node_id::NodeId;

/// Nodes per bucket (Kademlia `k`).
pub const BUCKET_SIZE: usize = 8;

/// Consecutive unanswered queries after which a node is bad.
pub const MAX_FAILURES: u8 = 3;

/// A node not heard from for this long is questionable.
pub const NODE_GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

pub const DEFAULT_PORT: u16 = 6881;

/// Well-known DHT bootstrap routers.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Tuning for a [`DhtServer`](super::DhtServer) / [`Engine`](super::Engine).
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub listen_addr: SocketAddr,
    /// Fixed local id; a random one is generated when absent.
    pub node_id: Option<NodeId>,
    /// `host:port` routers resolved when no initial nodes are known.
    pub bootstrap_routers: Vec<String>,
    pub query_timeout: Duration,
    pub max_pending_queries: usize,
    /// Size of the closest-node sets kept by lookups and returned by `find_node`.
    pub k: usize,
    /// Initialise stops early once the routing table holds this many nodes.
    pub min_healthy_nodes: usize,
    /// Peers accumulated by one get_peers lookup.
    pub max_peers_per_lookup: usize,
    /// ReplaceNode leaves a bucket alone if its oldest node was seen this recently.
    pub replace_recency_window: Duration,
    pub bucket_refresh_interval: Duration,
    pub token_rotation_interval: Duration,
    pub peer_announce_lifetime: Duration,
    pub max_peers_per_info_hash: usize,
    pub maintenance_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            node_id: None,
            bootstrap_routers: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            query_timeout: Duration::from_secs(15),
            max_pending_queries: 1024,
            k: BUCKET_SIZE,
            min_healthy_nodes: 32,
            max_peers_per_lookup: 50,
            replace_recency_window: Duration::from_secs(3 * 60),
            bucket_refresh_interval: Duration::from_secs(15 * 60),
            token_rotation_interval: Duration::from_secs(5 * 60),
            peer_announce_lifetime: Duration::from_secs(30 * 60),
            max_peers_per_info_hash: 1000,
            maintenance_interval: Duration::from_secs(5),
        }
    }
}
