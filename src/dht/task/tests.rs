use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::closest::CandidateState;
use super::ClosestNodes;
use crate::dht::node_id::NodeId;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn id(first: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = first;
    NodeId(bytes)
}

#[test]
fn test_closest_nodes_keeps_nearest() {
    let mut closest = ClosestNodes::new(NodeId::ZERO, 3);
    assert!(closest.insert(id(0x40), addr(1)));
    assert!(closest.insert(id(0x10), addr(2)));
    assert!(closest.insert(id(0x80), addr(3)));

    // Farther than everything in a full set.
    assert!(!closest.insert(id(0xf0), addr(4)));
    // Closer than the farthest, which gets pushed out.
    assert!(closest.insert(id(0x01), addr(5)));
    // Duplicate.
    assert!(!closest.insert(id(0x01), addr(5)));

    let ids: Vec<NodeId> = closest.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![id(0x01), id(0x10), id(0x40)]);
}

#[test]
fn test_closest_nodes_next_fresh_nearest_first() {
    let mut closest = ClosestNodes::new(id(0xff), 8);
    closest.insert(id(0x00), addr(1));
    closest.insert(id(0xf0), addr(2));

    assert_eq!(closest.next_fresh(), Some((id(0xf0), addr(2))));
    assert_eq!(closest.next_fresh(), Some((id(0x00), addr(1))));
    assert_eq!(closest.next_fresh(), None);

    closest.get_mut(&id(0xf0)).unwrap().state = CandidateState::Responded;
    assert!(closest.remove(&id(0x00)).is_some());
    let states: Vec<CandidateState> = closest.iter().map(|c| c.state).collect();
    assert_eq!(states, vec![CandidateState::Responded]);
}
