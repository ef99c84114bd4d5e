use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use slab::Slab;
use tracing::{debug, trace};

use super::bucket::{Bucket, BucketInsert, NodeKey};
use super::node::{encode_compact_nodes, Node, NodeState};
use super::node_id::NodeId;

/// Outcome of [`RoutingTable::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Added,
    /// The id is already known; nothing changed.
    AlreadyPresent,
    /// The owning bucket is full of live nodes and cannot split. The node is
    /// parked as that bucket's replacement until a liveness check evicts
    /// someone.
    ReplacementPending,
    /// The local node's own id.
    Rejected,
}

/// Kademlia routing table.
///
/// Buckets are kept sorted by `min` and always partition the whole id space.
/// Node records live in one arena; buckets refer to them by key, so a split
/// only moves keys around.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    nodes: Slab<Node>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, now: Instant) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket::full_range(now)],
            nodes: Slab::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Index of the bucket whose range contains `id`.
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        self.buckets.partition_point(|b| b.min() <= *id) - 1
    }

    pub fn bucket_for(&self, id: &NodeId) -> &Bucket {
        &self.buckets[self.bucket_index(id)]
    }

    fn key_of(&self, id: &NodeId) -> Option<NodeKey> {
        let bucket = self.bucket_for(id);
        bucket
            .nodes()
            .iter()
            .copied()
            .chain(bucket.replacement())
            .find(|&k| self.nodes[k].id == *id)
    }

    pub fn add(&mut self, node: Node, now: Instant) -> Insertion {
        if node.id == self.local_id {
            return Insertion::Rejected;
        }
        if self.key_of(&node.id).is_some() {
            return Insertion::AlreadyPresent;
        }

        let id = node.id;
        let key = self.nodes.insert(node);

        loop {
            let index = self.bucket_index(&id);
            let bucket = &self.buckets[index];

            if bucket.is_full() && !bucket.has_bad(&self.nodes, now) {
                if let Some((left, right)) = bucket.split(&self.local_id, &self.nodes, now) {
                    trace!("splitting bucket at depth {} for {}", bucket.depth(), id);
                    self.buckets[index] = left;
                    self.buckets.insert(index + 1, right);
                    continue;
                }
            }

            return match self.buckets[index].add(key, &self.nodes, now) {
                BucketInsert::Added => Insertion::Added,
                BucketInsert::Evicted(bad) => {
                    let evicted = self.nodes.remove(bad);
                    debug!("evicted bad node {} to make room for {}", evicted.id, id);
                    Insertion::Added
                }
                BucketInsert::Replacement { displaced } => {
                    if let Some(old) = displaced {
                        self.nodes.remove(old);
                    }
                    Insertion::ReplacementPending
                }
            };
        }
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&Node> {
        let key = self.key_of(id)?;
        self.bucket_for(id)
            .contains(key)
            .then(|| &self.nodes[key])
    }

    pub fn find_node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let key = self.key_of(id)?;
        if self.bucket_for(id).contains(key) {
            Some(&mut self.nodes[key])
        } else {
            None
        }
    }

    /// Replacement waiting in the bucket that owns `id`, if any.
    pub fn replacement_for(&self, id: &NodeId) -> Option<&Node> {
        self.bucket_for(id).replacement().map(|k| &self.nodes[k])
    }

    fn members(&self) -> impl Iterator<Item = &Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes().iter().map(|&k| &self.nodes[k]))
    }

    /// The `count` non-bad nodes closest to `target`, nearest first.
    pub fn get_closest(&self, target: &NodeId, count: usize, now: Instant) -> Vec<Node> {
        if count == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<(NodeId, NodeKey)> = BinaryHeap::with_capacity(count + 1);
        for bucket in &self.buckets {
            for &key in bucket.nodes() {
                let node = &self.nodes[key];
                if node.state(now) == NodeState::Bad {
                    continue;
                }
                let distance = node.id.distance(target);
                if heap.len() == count {
                    match heap.peek() {
                        Some(&(farthest, _)) if distance < farthest => {
                            heap.pop();
                        }
                        _ => continue,
                    }
                }
                heap.push((distance, key));
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|(_, key)| self.nodes[key].clone())
            .collect()
    }

    pub fn count_nodes(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    /// Forgets every node, leaving a single full-range bucket.
    pub fn clear(&mut self, now: Instant) {
        self.nodes.clear();
        self.buckets = vec![Bucket::full_range(now)];
    }

    /// Records traffic from `id`. Returns false if the node is not a member.
    ///
    /// Traffic from an address other than the recorded one only counts once
    /// the recorded entry has gone bad; until then the member keeps its
    /// address and its freshness is left alone.
    pub fn mark_seen(&mut self, id: &NodeId, addr: SocketAddr, now: Instant) -> bool {
        let index = self.bucket_index(id);
        let Some(node) = self.find_node_mut(id) else {
            return false;
        };
        if node.addr != addr {
            if node.state(now) != NodeState::Bad {
                trace!("ignoring {} claimed from {}, known at {}", id, addr, node.addr);
                return true;
            }
            debug!("node {} moved from {} to {}", id, node.addr, addr);
            node.addr = addr;
        }
        node.seen(now);
        node.currently_pinging = false;
        self.buckets[index].touch(now);
        true
    }

    /// Counts a failed query against `id`, returning its new state.
    pub fn mark_failed(&mut self, id: &NodeId, now: Instant) -> Option<NodeState> {
        let node = self.find_node_mut(id)?;
        node.failed();
        node.currently_pinging = false;
        Some(node.state(now))
    }

    pub fn set_pinging(&mut self, id: &NodeId, pinging: bool) {
        if let Some(node) = self.find_node_mut(id) {
            node.currently_pinging = pinging;
        }
    }

    /// Drops every in-flight liveness marker, e.g. once their queries are abandoned.
    pub fn clear_pinging(&mut self) {
        for (_, node) in self.nodes.iter_mut() {
            node.currently_pinging = false;
        }
    }

    pub fn set_token(&mut self, id: &NodeId, token: Bytes) {
        if let Some(node) = self.find_node_mut(id) {
            node.set_token(token);
        }
    }

    /// Swaps the member `old` for the bucket's waiting replacement.
    /// Returns the promoted node's id.
    pub fn replace_with_standby(&mut self, old: &NodeId, now: Instant) -> Option<NodeId> {
        let index = self.bucket_index(old);
        let old_key = self.key_of(old)?;
        let bucket = &mut self.buckets[index];
        if !bucket.contains(old_key) {
            return None;
        }
        let new_key = bucket.take_replacement()?;
        bucket.replace(old_key, new_key, now);
        let removed = self.nodes.remove(old_key);
        let promoted = self.nodes[new_key].id;
        debug!("replaced node {} with {}", removed.id, promoted);
        Some(promoted)
    }

    /// Drops the standby of the bucket owning `id`.
    pub fn discard_replacement(&mut self, id: &NodeId) {
        let index = self.bucket_index(id);
        if let Some(key) = self.buckets[index].take_replacement() {
            self.nodes.remove(key);
        }
    }

    /// Members of the bucket owning `id`, oldest seen first.
    pub fn oldest_in_bucket(&self, id: &NodeId) -> Vec<&Node> {
        self.bucket_for(id)
            .oldest_first(&self.nodes)
            .into_iter()
            .map(|k| &self.nodes[k])
            .collect()
    }

    /// Nodes that should get a liveness ping: one per full bucket at most.
    pub fn ping_candidates(&self, now: Instant) -> Vec<(NodeId, SocketAddr)> {
        self.buckets
            .iter()
            .filter(|b| b.is_full())
            .filter_map(|b| b.ping_for_replace(&self.nodes, now))
            .map(|k| (self.nodes[k].id, self.nodes[k].addr))
            .collect()
    }

    /// Buckets untouched for `max_age`, each as a random id inside its range.
    /// Their `last_changed` is reset so each is picked once per period.
    pub fn take_stale_buckets(&mut self, max_age: Duration, now: Instant) -> Vec<NodeId> {
        self.buckets
            .iter_mut()
            .filter(|b| now.saturating_duration_since(b.last_changed()) >= max_age)
            .map(|b| {
                b.touch(now);
                NodeId::random_with_prefix(&b.min(), b.depth())
            })
            .collect()
    }

    /// Compact node list of every good node, for persisting across restarts.
    pub fn save_nodes(&self, now: Instant) -> Bytes {
        encode_compact_nodes(self.members().filter(|n| n.state(now) == NodeState::Good))
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.members().cloned().collect()
    }
}
