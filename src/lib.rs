//! rbit-dht - BitTorrent Mainline DHT
//!
//! A Kademlia routing table and lookup engine speaking the KRPC protocol of
//! BEP-5, for discovering peers without a tracker.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 routing table, lookups and the UDP server

pub mod bencode;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{
    DhtConfig, DhtError, DhtEvent, DhtMessage, DhtServer, DhtState, Engine, Node, NodeId,
    RoutingTable,
};
