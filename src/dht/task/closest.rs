use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::dht::node_id::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidateState {
    Fresh,
    Querying,
    Responded,
}

#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub state: CandidateState,
    pub token: Option<Bytes>,
}

/// The `capacity` nodes nearest to a target, ordered by XOR distance.
///
/// A node farther than every current entry is refused once the set is full,
/// and inserting a closer one pushes the farthest out, so the set only ever
/// gets closer to the target.
pub(crate) struct ClosestNodes {
    target: NodeId,
    capacity: usize,
    entries: BTreeMap<NodeId, Candidate>,
}

impl ClosestNodes {
    pub fn new(target: NodeId, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            entries: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn insert(&mut self, id: NodeId, addr: SocketAddr) -> bool {
        let distance = id.distance(&self.target);
        if self.entries.contains_key(&distance) || self.capacity == 0 {
            return false;
        }

        if self.entries.len() >= self.capacity {
            match self.entries.last_key_value() {
                Some((farthest, _)) if distance < *farthest => {
                    self.entries.pop_last();
                }
                _ => return false,
            }
        }

        self.entries.insert(
            distance,
            Candidate {
                id,
                addr,
                state: CandidateState::Fresh,
                token: None,
            },
        );
        true
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Candidate> {
        self.entries.get_mut(&id.distance(&self.target))
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Candidate> {
        self.entries.remove(&id.distance(&self.target))
    }

    /// Nearest candidate not yet queried, marked as being queried.
    pub fn next_fresh(&mut self) -> Option<(NodeId, SocketAddr)> {
        self.entries
            .values_mut()
            .find(|c| c.state == CandidateState::Fresh)
            .map(|c| {
                c.state = CandidateState::Querying;
                (c.id, c.addr)
            })
    }

    /// Candidates nearest first.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.entries.values()
    }
}
