//! Distributed Hash Table (BEP-5)
//!
//! This module implements the Kademlia-based DHT used by BitTorrent
//! for trackerless peer discovery.
//!
//! The protocol logic lives in [`Engine`], a state machine that is fed
//! datagrams and the current time and never touches a socket or a clock.
//! [`DhtServer`] runs an engine on a tokio task behind a UDP socket and is
//! what most callers want.

mod bucket;
mod config;
mod engine;
mod error;
mod message;
mod node;
mod node_id;
mod peer_store;
mod routing;
mod server;
mod task;
mod token;
mod transaction;

pub use bucket::Bucket;
pub use config::{DhtConfig, BOOTSTRAP_NODES, BUCKET_SIZE, DEFAULT_PORT, MAX_FAILURES};
pub use engine::{DhtEvent, DhtState, Engine, LookupResult};
pub use error::DhtError;
pub use message::{
    DhtMessage, DhtQuery, DhtResponse, MessageBody, TransactionId, ERROR_GENERIC,
    ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL, ERROR_SERVER,
};
pub use node::{
    decode_compact_nodes, decode_compact_peer, encode_compact_nodes, encode_compact_peer, Node,
    NodeState, COMPACT_NODE_LEN, COMPACT_PEER_LEN,
};
pub use node_id::{NodeId, ID_BITS, ID_LEN};
pub use routing::{Insertion, RoutingTable};
pub use server::DhtServer;
pub use transaction::TaskId;

#[cfg(test)]
mod tests;
