use std::collections::HashSet;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info};

use super::closest::CandidateState;
use super::{ClosestNodes, Context, Progress, QueryOutcome, TaskOutput};
use crate::dht::message::DhtQuery;
use crate::dht::node::Node;
use crate::dht::node_id::NodeId;
use crate::dht::transaction::{Owner, TaskId, Transaction};
use crate::dht::DhtEvent;

/// Iterative `get_peers` for an info-hash.
///
/// `closest_known` decides who gets queried; `closest_active` keeps the
/// nearest nodes that actually answered, with the token each one gave us,
/// for a following announce.
pub(crate) struct GetPeersLookup {
    task: TaskId,
    closest_known: ClosestNodes,
    closest_active: ClosestNodes,
    queried: HashSet<NodeId>,
    outstanding: usize,
    peers: Vec<SocketAddr>,
    seen_peers: HashSet<SocketAddr>,
}

impl GetPeersLookup {
    pub fn new(task: TaskId, info_hash: NodeId, k: usize, seeds: Vec<Node>) -> Self {
        let mut closest_known = ClosestNodes::new(info_hash, k);
        for node in seeds {
            closest_known.insert(node.id, node.addr);
        }
        Self {
            task,
            closest_known,
            closest_active: ClosestNodes::new(info_hash, k),
            queried: HashSet::new(),
            outstanding: 0,
            peers: Vec::new(),
            seen_peers: HashSet::new(),
        }
    }

    pub fn info_hash(&self) -> NodeId {
        *self.closest_known.target()
    }

    pub fn start(&mut self, cx: &mut Context<'_>) -> Progress {
        self.pump(cx)
    }

    pub fn on_outcome(
        &mut self,
        cx: &mut Context<'_>,
        txn: &Transaction,
        outcome: QueryOutcome,
    ) -> Progress {
        self.outstanding = self.outstanding.saturating_sub(1);

        match outcome {
            QueryOutcome::Response(response) => {
                if let Some(token) = &response.token {
                    cx.table.set_token(&response.id, token.clone());
                }
                self.record_active(response.id, txn.addr, response.token.clone());
                self.record_peers(cx, &response.values);

                cx.learn(&response.nodes);
                for node in &response.nodes {
                    if node.id != cx.local_id && !self.queried.contains(&node.id) {
                        self.closest_known.insert(node.id, node.addr);
                    }
                }
            }
            QueryOutcome::Error { .. } | QueryOutcome::TimedOut => {
                if let Some(id) = txn.node_id {
                    self.closest_known.remove(&id);
                }
            }
        }

        self.pump(cx)
    }

    fn record_active(&mut self, id: NodeId, addr: SocketAddr, token: Option<Bytes>) {
        self.closest_active.insert(id, addr);
        if let Some(candidate) = self.closest_active.get_mut(&id) {
            candidate.state = CandidateState::Responded;
            candidate.token = token;
        }
    }

    fn record_peers(&mut self, cx: &mut Context<'_>, values: &[SocketAddr]) {
        let room = cx
            .config
            .max_peers_per_lookup
            .saturating_sub(self.peers.len());

        let fresh: Vec<SocketAddr> = values
            .iter()
            .copied()
            .filter(|addr| self.seen_peers.insert(*addr))
            .take(room)
            .collect();

        if fresh.is_empty() {
            return;
        }

        self.peers.extend_from_slice(&fresh);
        cx.events.push_back(DhtEvent::PeersFound {
            info_hash: self.info_hash(),
            peers: fresh,
        });
    }

    fn pump(&mut self, cx: &mut Context<'_>) -> Progress {
        let info_hash = self.info_hash();
        while let Some((id, addr)) = self.closest_known.next_fresh() {
            self.queried.insert(id);
            let query = DhtQuery::GetPeers { info_hash };
            match cx.send_query(Owner::Task(self.task), Some(id), addr, query) {
                Ok(_) => self.outstanding += 1,
                Err(e) => {
                    debug!("get_peers to {} not sent: {}", addr, e);
                    self.closest_known.remove(&id);
                }
            }
        }

        if self.outstanding > 0 {
            return Progress::Running;
        }

        info!(
            "DHT get_peers found {} peers after querying {} nodes",
            self.peers.len(),
            self.queried.len()
        );
        Progress::Done(TaskOutput::Peers {
            info_hash,
            peers: self.peers.clone(),
        })
    }

    /// Nodes that answered, nearest first, with the token they handed out.
    pub fn closest_active(&self) -> impl Iterator<Item = (NodeId, SocketAddr, Option<&Bytes>)> {
        self.closest_active
            .iter()
            .map(|c| (c.id, c.addr, c.token.as_ref()))
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }
}
