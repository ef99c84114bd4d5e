use super::bucket::BucketInsert;
use super::message::ERROR_METHOD_UNKNOWN;
use super::peer_store::PeerStore;
use super::token::TokenSecrets;
use super::transaction::{Owner, Transactions};
use super::*;
use bytes::Bytes;
use slab::Slab;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
}

/// An id whose first byte is `first` and every other byte is `fill`.
fn id_with(first: u8, fill: u8) -> NodeId {
    let mut bytes = [fill; 20];
    bytes[0] = first;
    NodeId(bytes)
}

#[test]
fn test_node_id_generate() {
    let id1 = NodeId::generate();
    let id2 = NodeId::generate();
    assert_ne!(id1, id2);
}

#[test]
fn test_node_id_from_bytes() {
    let bytes = [1u8; 20];
    let id = NodeId::from_bytes(&bytes).unwrap();
    assert_eq!(id.0, bytes);
}

#[test]
fn test_node_id_from_bytes_invalid() {
    assert!(matches!(
        NodeId::from_bytes(&[1u8; 10]),
        Err(DhtError::InvalidNodeId)
    ));
    assert!(NodeId::from_bytes(&[1u8; 21]).is_err());
}

#[test]
fn test_node_id_distance() {
    let a = NodeId::generate();
    let b = NodeId::generate();

    assert_eq!(a.distance(&b), b.distance(&a));
    assert_eq!(a.distance(&a), NodeId::ZERO);
    assert_eq!(NodeId::ZERO.distance(&NodeId::MAX), NodeId::MAX);
}

#[test]
fn test_node_id_ordering() {
    let low = id_with(0x00, 0xff);
    let mid = id_with(0x7f, 0x00);
    let high = id_with(0x80, 0x00);

    assert!(low < mid && mid < high && low < high);
    assert_eq!(low.cmp(&low), std::cmp::Ordering::Equal);

    let mut ids: Vec<NodeId> = (0..32).map(|_| NodeId::generate()).collect();
    ids.sort();
    assert!(ids.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_node_id_bits_and_prefix() {
    let id = id_with(0b1010_0000, 0);
    assert!(id.bit(0));
    assert!(!id.bit(1));
    assert!(id.bit(2));
    assert_eq!(NodeId::ZERO.leading_zeros(), 160);
    assert_eq!(id_with(0x01, 0).leading_zeros(), 7);

    let other = id_with(0b1011_1111, 0xff);
    assert!(id.shares_prefix(&other, 3));
    assert!(!id.shares_prefix(&other, 4));

    for _ in 0..16 {
        let random = NodeId::random_with_prefix(&id, 12);
        assert!(random.shares_prefix(&id, 12));
    }
}

#[test]
fn test_node_compact() {
    let id = NodeId([1u8; 20]);
    let node = Node::new(id, addr(6881));

    let compact = node.to_compact().unwrap();
    assert_eq!(compact.len(), COMPACT_NODE_LEN);

    let parsed = Node::from_compact(&compact).unwrap();
    assert_eq!(parsed.id, id);
    assert_eq!(parsed.addr, addr(6881));
}

#[test]
fn test_compact_nodes_skip_partial_record() {
    let nodes = vec![Node::new(id_with(1, 1), addr(1)), Node::new(id_with(2, 2), addr(2))];
    let mut compact = encode_compact_nodes(&nodes).to_vec();
    assert_eq!(compact.len(), 2 * COMPACT_NODE_LEN);

    compact.extend_from_slice(&[0u8; 10]);
    let decoded = decode_compact_nodes(&compact);
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[1].addr, addr(2));
}

#[test]
fn test_compact_peer() {
    let peer = addr(51413);
    let compact = encode_compact_peer(&peer).unwrap();
    assert_eq!(compact, [127, 0, 0, 1, 0xc8, 0xd5]);
    assert_eq!(decode_compact_peer(&compact), Some(peer));
    assert_eq!(decode_compact_peer(&compact[..5]), None);

    let v6: SocketAddr = "[::1]:6881".parse().unwrap();
    assert!(encode_compact_peer(&v6).is_none());
}

#[test]
fn test_node_state() {
    let now = Instant::now();
    let mut node = Node::new(NodeId::generate(), addr(6881));
    assert_eq!(node.state(now), NodeState::Unknown);

    node.seen(now);
    assert_eq!(node.state(now), NodeState::Good);
    assert_eq!(
        node.state(now + Duration::from_secs(16 * 60)),
        NodeState::Questionable
    );

    node.failed();
    assert_eq!(node.state(now), NodeState::Questionable);
    node.failed();
    node.failed();
    assert_eq!(node.state(now), NodeState::Bad);

    node.seen(now);
    assert_eq!(node.failures(), 0);
    assert_eq!(node.state(now), NodeState::Good);
}

#[test]
fn test_bucket_add_evicts_bad_before_queueing() {
    let now = Instant::now();
    let mut arena = Slab::new();
    let mut bucket = Bucket::full_range(now);

    let keys: Vec<_> = (0..BUCKET_SIZE as u8)
        .map(|i| arena.insert(Node::new(id_with(i, i), addr(i as u16 + 1))))
        .collect();
    for &key in &keys {
        assert_eq!(bucket.add(key, &arena, now), BucketInsert::Added);
    }
    assert!(bucket.is_full());

    let standby = arena.insert(Node::new(id_with(0x40, 0), addr(100)));
    assert_eq!(
        bucket.add(standby, &arena, now),
        BucketInsert::Replacement { displaced: None }
    );

    let newer = arena.insert(Node::new(id_with(0x41, 0), addr(101)));
    assert_eq!(
        bucket.add(newer, &arena, now),
        BucketInsert::Replacement {
            displaced: Some(standby)
        }
    );
    assert_eq!(bucket.replacement(), Some(newer));

    for _ in 0..MAX_FAILURES {
        arena[keys[3]].failed();
    }
    let fresh = arena.insert(Node::new(id_with(0x42, 0), addr(102)));
    let result = bucket.add(fresh, &arena, now);
    assert_eq!(result, BucketInsert::Evicted(keys[3]));
    assert!(result.is_member());
    assert!(bucket.contains(fresh));
    assert_eq!(bucket.len(), BUCKET_SIZE);
}

#[test]
fn test_bucket_split_partitions_nodes() {
    let now = Instant::now();
    let local = id_with(0x10, 0);
    let mut arena = Slab::new();
    let mut bucket = Bucket::full_range(now);

    for i in 0..BUCKET_SIZE as u8 {
        let first = if i % 2 == 0 { 0x20 + i } else { 0xa0 + i };
        let key = arena.insert(Node::new(id_with(first, i), addr(i as u16 + 1)));
        bucket.add(key, &arena, now);
    }
    let standby = arena.insert(Node::new(id_with(0xf0, 0), addr(50)));
    bucket.add(standby, &arena, now);

    let (left, right) = bucket.split(&local, &arena, now).unwrap();
    assert_eq!(left.min(), NodeId::ZERO);
    assert_eq!(left.max(), Some(right.min()));
    assert_eq!(right.max(), None);
    assert_eq!(right.min(), bucket.median());
    assert_eq!(left.len() + right.len(), BUCKET_SIZE);
    assert_eq!(right.replacement(), Some(standby));
    assert_eq!(left.replacement(), None);

    for &key in left.nodes() {
        assert!(left.can_contain(&arena[key].id));
    }
    for &key in right.nodes() {
        assert!(right.can_contain(&arena[key].id));
    }

    // The half without the local id never splits.
    assert!(right.split(&local, &arena, now).is_none());
}

#[test]
fn test_bucket_refuses_split_below_capacity_span() {
    let now = Instant::now();
    let local = NodeId::generate();
    let mut table = RoutingTable::new(local, now);

    // Ids differing from the local id only in the last two bytes keep
    // splitting the local bucket.
    for i in 0..64u16 {
        let mut id = local;
        id.0[18] ^= (i >> 2) as u8 + 1;
        id.0[19] ^= (i & 0x3) as u8;
        table.add(Node::new(id, addr(i + 1)), now);
    }

    for bucket in table.buckets() {
        assert!(bucket.len() <= BUCKET_SIZE);
        assert!(bucket.depth() <= ID_BITS - 2);
    }
}

#[test]
fn test_routing_table_scenario_a_single_split() {
    let now = Instant::now();
    let local = id_with(0x01, 0);
    let mut table = RoutingTable::new(local, now);

    for i in 0..5u8 {
        let id = id_with(0x10 + i, i);
        assert_eq!(table.add(Node::new(id, addr(i as u16 + 1)), now), Insertion::Added);
    }
    for i in 0..4u8 {
        let id = id_with(0x90 + i, i);
        assert_eq!(table.add(Node::new(id, addr(i as u16 + 10)), now), Insertion::Added);
    }

    let buckets = table.buckets();
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0].min(), NodeId::ZERO);
    assert_eq!(buckets[0].max(), Some(buckets[1].min()));
    assert_eq!(buckets[1].max(), None);
    assert_eq!(buckets[0].len(), 5);
    assert_eq!(buckets[1].len(), 4);
    assert_eq!(table.count_nodes(), 9);
}

#[test]
fn test_routing_table_partition_invariant() {
    let now = Instant::now();
    let local = NodeId::generate();
    let mut table = RoutingTable::new(local, now);

    for i in 0..500u16 {
        table.add(Node::new(NodeId::generate(), addr(i + 1)), now);
    }

    let buckets = table.buckets();
    assert_eq!(buckets[0].min(), NodeId::ZERO);
    assert_eq!(buckets.last().unwrap().max(), None);
    for pair in buckets.windows(2) {
        assert_eq!(pair[0].max(), Some(pair[1].min()));
    }
    assert!(table.count_nodes() <= BUCKET_SIZE * buckets.len());

    for node in table.all_nodes() {
        let owner = table.bucket_for(&node.id);
        assert!(owner.can_contain(&node.id));
        assert!(owner.len() <= BUCKET_SIZE);
    }
}

#[test]
fn test_routing_table_rejects_self_and_duplicates() {
    let now = Instant::now();
    let local = NodeId::generate();
    let mut table = RoutingTable::new(local, now);

    assert_eq!(table.add(Node::new(local, addr(1)), now), Insertion::Rejected);

    let id = NodeId::generate();
    assert_eq!(table.add(Node::new(id, addr(2)), now), Insertion::Added);
    assert_eq!(table.add(Node::new(id, addr(2)), now), Insertion::AlreadyPresent);
    assert_eq!(table.count_nodes(), 1);
    assert_eq!(table.find_node(&id).unwrap().addr, addr(2));
}

#[test]
fn test_routing_table_full_far_bucket_queues_replacement() {
    let now = Instant::now();
    let local = id_with(0x00, 0x11);
    let mut table = RoutingTable::new(local, now);

    for i in 0..BUCKET_SIZE as u8 {
        table.add(Node::new(id_with(0x80 + i, i), addr(i as u16 + 1)), now);
    }
    let standby = id_with(0xc0, 0);
    assert_eq!(
        table.add(Node::new(standby, addr(99)), now),
        Insertion::ReplacementPending
    );
    assert_eq!(table.count_nodes(), BUCKET_SIZE);
    assert_eq!(table.replacement_for(&standby).unwrap().id, standby);
    assert!(table.find_node(&standby).is_none());

    let victim = id_with(0x83, 3);
    assert_eq!(table.replace_with_standby(&victim, now), Some(standby));
    assert!(table.find_node(&victim).is_none());
    assert!(table.find_node(&standby).is_some());
    assert!(table.replacement_for(&standby).is_none());
    assert_eq!(table.count_nodes(), BUCKET_SIZE);
}

#[test]
fn test_routing_table_get_closest() {
    let now = Instant::now();
    let local = NodeId::generate();
    let mut table = RoutingTable::new(local, now);
    for i in 0..200u16 {
        table.add(Node::new(NodeId::generate(), addr(i + 1)), now);
    }

    let target = NodeId::generate();
    let closest = table.get_closest(&target, 8, now);
    assert_eq!(closest.len(), 8);

    let distances: Vec<NodeId> = closest.iter().map(|n| n.id.distance(&target)).collect();
    assert!(distances.windows(2).all(|w| w[0] <= w[1]));

    let farthest = *distances.last().unwrap();
    for node in table.all_nodes() {
        if !closest.iter().any(|c| c.id == node.id) {
            assert!(node.id.distance(&target) >= farthest);
        }
    }

    assert!(table.get_closest(&target, 0, now).is_empty());
}

#[test]
fn test_routing_table_get_closest_skips_bad() {
    let now = Instant::now();
    let mut table = RoutingTable::new(id_with(0, 0), now);
    let near = id_with(0x80, 0);
    let far = id_with(0xff, 0xff);
    table.add(Node::new(near, addr(1)), now);
    table.add(Node::new(far, addr(2)), now);

    for _ in 0..MAX_FAILURES {
        table.mark_failed(&near, now);
    }

    let closest = table.get_closest(&near, 8, now);
    assert_eq!(closest.len(), 1);
    assert_eq!(closest[0].id, far);
}

#[test]
fn test_routing_table_mark_seen_and_save() {
    let now = Instant::now();
    let mut table = RoutingTable::new(NodeId::generate(), now);
    let seen = NodeId::generate();
    let unseen = NodeId::generate();
    table.add(Node::new(seen, addr(1)), now);
    table.add(Node::new(unseen, addr(2)), now);

    assert!(table.mark_seen(&seen, addr(1), now));
    assert!(!table.mark_seen(&NodeId::generate(), addr(4), now));
    assert_eq!(table.find_node(&seen).unwrap().addr, addr(1));

    let saved = table.save_nodes(now);
    let restored = decode_compact_nodes(&saved);
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].id, seen);

    table.clear(now);
    assert_eq!(table.count_nodes(), 0);
    assert_eq!(table.buckets().len(), 1);
}

#[test]
fn test_routing_table_mark_seen_keeps_known_address() {
    let now = Instant::now();
    let later = now + Duration::from_secs(60);
    let mut table = RoutingTable::new(NodeId::generate(), now);
    let id = NodeId::generate();
    table.add(Node::new(id, addr(1)), now);

    // A live entry is not moved or refreshed by traffic from elsewhere.
    assert!(table.mark_seen(&id, addr(1), now));
    assert!(table.mark_seen(&id, addr(9), later));
    let node = table.find_node(&id).unwrap();
    assert_eq!(node.addr, addr(1));
    assert_eq!(node.last_seen(), Some(now));

    // Once the recorded address has stopped answering, the new one is taken.
    for _ in 0..3 {
        table.mark_failed(&id, later);
    }
    assert_eq!(table.find_node(&id).unwrap().state(later), NodeState::Bad);
    assert!(table.mark_seen(&id, addr(9), later));
    let node = table.find_node(&id).unwrap();
    assert_eq!(node.addr, addr(9));
    assert_eq!(node.state(later), NodeState::Good);
}

#[test]
fn test_routing_table_clear_pinging() {
    let now = Instant::now();
    let mut table = RoutingTable::new(NodeId::generate(), now);
    let ids: Vec<NodeId> = (0..3).map(|_| NodeId::generate()).collect();
    for (i, id) in ids.iter().enumerate() {
        table.add(Node::new(*id, addr(10 + i as u16)), now);
        table.set_pinging(id, true);
    }
    assert!(table.all_nodes().iter().all(|n| n.currently_pinging));

    table.clear_pinging();
    assert!(table.all_nodes().iter().all(|n| !n.currently_pinging));
}

#[test]
fn test_routing_table_stale_buckets() {
    let now = Instant::now();
    let mut table = RoutingTable::new(NodeId::generate(), now);
    let later = now + Duration::from_secs(15 * 60);

    let stale = table.take_stale_buckets(Duration::from_secs(15 * 60), later);
    assert_eq!(stale.len(), 1);
    assert!(table
        .take_stale_buckets(Duration::from_secs(15 * 60), later)
        .is_empty());
}

#[test]
fn test_message_query_roundtrip() {
    let sender = NodeId::generate();
    let info_hash = NodeId::generate();
    let msg = DhtMessage::query(
        Bytes::from_static(b"aa"),
        sender,
        DhtQuery::AnnouncePeer {
            info_hash,
            port: 6881,
            token: Bytes::from_static(b"secret"),
            implied_port: true,
        },
    );

    let parsed = DhtMessage::parse(&msg.encode()).unwrap();
    assert_eq!(parsed, msg);
    assert_eq!(parsed.sender_id(), Some(sender));
}

#[test]
fn test_message_ping_wire_format() {
    let sender = NodeId([b'a'; 20]);
    let msg = DhtMessage::query(Bytes::from_static(b"aa"), sender, DhtQuery::Ping);
    assert_eq!(
        msg.encode(),
        b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t2:aa1:y1:qe".to_vec()
    );
}

#[test]
fn test_message_response_with_nodes_values_token() {
    let mut response = DhtResponse::new(NodeId::generate());
    response.nodes = vec![Node::new(NodeId::generate(), addr(1))];
    response.values = vec![addr(6881), addr(6882)];
    response.token = Some(Bytes::from_static(b"tok"));

    let msg = DhtMessage::response(Bytes::from_static(b"xy"), response.clone());
    let parsed = DhtMessage::parse(&msg.encode()).unwrap();
    match parsed.body {
        MessageBody::Response(r) => {
            assert_eq!(r.id, response.id);
            assert_eq!(r.nodes[0].id, response.nodes[0].id);
            assert_eq!(r.values, response.values);
            assert_eq!(r.token, response.token);
        }
        other => panic!("expected response, got {:?}", other),
    }
}

#[test]
fn test_message_error() {
    let data = b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee";
    let msg = DhtMessage::parse(data).unwrap();
    assert_eq!(
        msg.body,
        MessageBody::Error {
            code: 201,
            message: "A Generic Error Ocurred".into()
        }
    );
    assert_eq!(msg.sender_id(), None);
}

#[test]
fn test_message_unknown_method() {
    let sender = NodeId::generate();
    let msg = DhtMessage {
        transaction_id: Bytes::from_static(b"zz"),
        body: MessageBody::UnknownQuery {
            sender,
            method: "vote".into(),
        },
    };
    let parsed = DhtMessage::parse(&msg.encode()).unwrap();
    assert_eq!(parsed, msg);
    assert_eq!(ERROR_METHOD_UNKNOWN, 204);
}

#[test]
fn test_message_malformed() {
    assert!(DhtMessage::parse(b"not bencode").is_err());
    assert!(DhtMessage::parse(b"li1ee").is_err());
    assert!(DhtMessage::parse(b"d1:t2:aa1:y1:xe").is_err());
    // Query without a sender id.
    assert!(DhtMessage::parse(b"d1:ad0:e1:q4:ping1:t2:aa1:y1:qe").is_err());
}

#[test]
fn test_transactions_complete_matches_id_and_addr() {
    let now = Instant::now();
    let mut txns = Transactions::new(Duration::from_secs(15), 16);
    let tid = txns
        .begin(addr(1), None, "ping", Owner::Detached, now)
        .unwrap();
    assert_eq!(txns.len(), 1);

    assert!(txns.complete(&tid, addr(2)).is_none());
    assert!(txns.complete(b"nope", addr(1)).is_none());

    let txn = txns.complete(&tid, addr(1)).unwrap();
    assert_eq!(txn.method, "ping");
    assert!(txns.is_empty());
    assert!(txns.complete(&tid, addr(1)).is_none());
}

#[test]
fn test_transactions_expire_exactly_once() {
    let now = Instant::now();
    let timeout = Duration::from_secs(15);
    let mut txns = Transactions::new(timeout, 16);
    let tid = txns.begin(addr(1), None, "ping", Owner::Liveness, now).unwrap();
    assert_eq!(txns.next_deadline(), Some(now + timeout));

    assert!(txns.expire(now + Duration::from_secs(14)).is_empty());
    let expired = txns.expire(now + timeout);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, tid);

    assert!(txns.expire(now + timeout * 2).is_empty());
    assert!(txns.complete(&tid, addr(1)).is_none());
    assert_eq!(txns.next_deadline(), None);
}

#[test]
fn test_transactions_pending_cap() {
    let now = Instant::now();
    let mut txns = Transactions::new(Duration::from_secs(15), 2);
    let a = txns.begin(addr(1), None, "ping", Owner::Task(1), now).unwrap();
    let b = txns.begin(addr(1), None, "ping", Owner::Task(1), now).unwrap();
    assert_ne!(a, b);
    assert_eq!(txns.outstanding(Owner::Task(1)), 2);

    assert!(matches!(
        txns.begin(addr(1), None, "ping", Owner::Task(1), now),
        Err(DhtError::TooManyPending)
    ));
}

#[test]
fn test_token_validation_and_rotation() {
    let mut secrets = TokenSecrets::new();
    let peer = addr(6881);
    let token = secrets.generate(&peer);
    assert_eq!(token.len(), 8);
    assert!(secrets.validate(&peer, &token));
    assert!(secrets.validate(&addr(7000), &token));

    let other: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    assert!(!secrets.validate(&other, &token));

    secrets.rotate();
    assert!(secrets.validate(&peer, &token));
    secrets.rotate();
    assert!(!secrets.validate(&peer, &token));
}

#[test]
fn test_peer_store_expiry_and_cap() {
    let now = Instant::now();
    let mut store = PeerStore::new(Duration::from_secs(30 * 60), 2);
    let hash = NodeId::generate();

    store.add_peer(hash, addr(1), now);
    store.add_peer(hash, addr(1), now);
    store.add_peer(hash, addr(2), now);
    store.add_peer(hash, addr(3), now);
    assert_eq!(store.get_peers(&hash, now), vec![addr(1), addr(2)]);
    assert!(store.get_peers(&NodeId::generate(), now).is_empty());
    assert_eq!(store.len(), 2);
    assert!(!store.is_empty());

    let later = now + Duration::from_secs(31 * 60);
    assert!(store.get_peers(&hash, later).is_empty());
    store.expire(later);
    assert!(store.is_empty());
    assert_eq!(store.len(), 0);
}
