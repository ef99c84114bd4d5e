use std::time::Instant;

use slab::Slab;

use super::config::BUCKET_SIZE;
use super::node::{Node, NodeState};
use super::node_id::{NodeId, ID_BITS};

/// Key of a [`Node`] in the routing table's arena.
pub type NodeKey = usize;

/// Outcome of [`Bucket::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketInsert {
    Added,
    /// The bucket was full; this bad node was dropped to make room.
    Evicted(NodeKey),
    /// The bucket is full of live nodes. The node is now the standby
    /// replacement, superseding `displaced`.
    Replacement { displaced: Option<NodeKey> },
}

impl BucketInsert {
    pub fn is_member(&self) -> bool {
        !matches!(self, BucketInsert::Replacement { .. })
    }
}

/// All known nodes whose id falls in `[min, max)`.
///
/// Buckets only ever come from halving the whole id space, so the range is
/// stored as `min` plus the number of leading bits (`depth`) every id in the
/// bucket shares with `min`.
#[derive(Debug, Clone)]
pub struct Bucket {
    min: NodeId,
    depth: usize,
    nodes: Vec<NodeKey>,
    replacement: Option<NodeKey>,
    last_changed: Instant,
}

impl Bucket {
    /// The bucket covering the entire id space.
    pub fn full_range(now: Instant) -> Self {
        Self::new(NodeId::ZERO, 0, now)
    }

    fn new(min: NodeId, depth: usize, now: Instant) -> Self {
        Self {
            min,
            depth,
            nodes: Vec::with_capacity(BUCKET_SIZE),
            replacement: None,
            last_changed: now,
        }
    }

    pub fn min(&self) -> NodeId {
        self.min
    }

    /// Exclusive upper bound; `None` when the range runs to the end of the id space.
    pub fn max(&self) -> Option<NodeId> {
        let mut max = self.min;
        for i in (0..self.depth).rev() {
            if max.bit(i) {
                max = max.with_bit(i, false);
            } else {
                return Some(max.with_bit(i, true));
            }
        }
        None
    }

    /// First id of the upper half.
    pub fn median(&self) -> NodeId {
        self.min.with_bit(self.depth, true)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn can_contain(&self, id: &NodeId) -> bool {
        id.shares_prefix(&self.min, self.depth)
    }

    pub fn nodes(&self) -> &[NodeKey] {
        &self.nodes
    }

    pub fn replacement(&self) -> Option<NodeKey> {
        self.replacement
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= BUCKET_SIZE
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains(&key)
    }

    pub fn last_changed(&self) -> Instant {
        self.last_changed
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_changed = now;
    }

    pub fn has_bad(&self, arena: &Slab<Node>, now: Instant) -> bool {
        self.nodes
            .iter()
            .any(|&k| arena[k].state(now) == NodeState::Bad)
    }

    pub fn add(&mut self, key: NodeKey, arena: &Slab<Node>, now: Instant) -> BucketInsert {
        if !self.is_full() {
            self.nodes.push(key);
            self.last_changed = now;
            return BucketInsert::Added;
        }

        let bad = self
            .nodes
            .iter()
            .position(|&k| arena[k].state(now) == NodeState::Bad);

        if let Some(pos) = bad {
            let evicted = std::mem::replace(&mut self.nodes[pos], key);
            self.last_changed = now;
            return BucketInsert::Evicted(evicted);
        }

        let displaced = self.replacement.replace(key).filter(|&k| k != key);
        BucketInsert::Replacement { displaced }
    }

    /// Whether the bucket may be halved: it must hold the local id and span at
    /// least `BUCKET_SIZE` ids.
    pub fn can_split(&self, local_id: &NodeId) -> bool {
        let span_bits = (ID_BITS - self.depth) as u32;
        self.can_contain(local_id) && span_bits >= BUCKET_SIZE.ilog2()
    }

    /// Halves the bucket at its median, moving every node (and the standby)
    /// into the child whose range contains it.
    pub fn split(
        &self,
        local_id: &NodeId,
        arena: &Slab<Node>,
        now: Instant,
    ) -> Option<(Bucket, Bucket)> {
        if !self.can_split(local_id) {
            return None;
        }

        let mut left = Bucket::new(self.min, self.depth + 1, now);
        let mut right = Bucket::new(self.median(), self.depth + 1, now);

        for &key in &self.nodes {
            if left.can_contain(&arena[key].id) {
                left.nodes.push(key);
            } else {
                right.nodes.push(key);
            }
        }

        if let Some(key) = self.replacement {
            if left.can_contain(&arena[key].id) {
                left.replacement = Some(key);
            } else {
                right.replacement = Some(key);
            }
        }

        Some((left, right))
    }

    /// Puts `new` in `old`'s slot, consuming it as the standby if it was one.
    pub fn replace(&mut self, old: NodeKey, new: NodeKey, now: Instant) -> bool {
        let Some(pos) = self.nodes.iter().position(|&k| k == old) else {
            return false;
        };
        self.nodes[pos] = new;
        if self.replacement == Some(new) {
            self.replacement = None;
        }
        self.last_changed = now;
        true
    }

    pub fn take_replacement(&mut self) -> Option<NodeKey> {
        self.replacement.take()
    }

    /// Members ordered by last seen, never-seen nodes first.
    pub fn oldest_first(&self, arena: &Slab<Node>) -> Vec<NodeKey> {
        let mut keys = self.nodes.clone();
        keys.sort_by_key(|&k| arena[k].last_seen());
        keys
    }

    /// Picks the node a liveness ping should go to, if any: the oldest
    /// unknown or questionable member. Nothing is picked while a ping for
    /// this bucket is still in flight.
    pub fn ping_for_replace(&self, arena: &Slab<Node>, now: Instant) -> Option<NodeKey> {
        if self.nodes.iter().any(|&k| arena[k].currently_pinging) {
            return None;
        }

        self.oldest_first(arena).into_iter().find(|&k| {
            matches!(
                arena[k].state(now),
                NodeState::Unknown | NodeState::Questionable
            )
        })
    }
}
