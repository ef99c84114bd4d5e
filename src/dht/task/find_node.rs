use std::collections::HashSet;
use std::net::SocketAddr;

use tracing::{debug, info};

use super::{ClosestNodes, Context, Progress, QueryOutcome, TaskOutput};
use crate::dht::message::DhtQuery;
use crate::dht::node::Node;
use crate::dht::node_id::NodeId;
use crate::dht::transaction::{Owner, TaskId, Transaction};

/// Iterative `find_node` towards a target.
///
/// Every candidate in the closest set is queried once; nodes returned by the
/// responses go into the routing table and, if they are closer, into the set.
pub(crate) struct FindNodeLookup {
    task: TaskId,
    closest: ClosestNodes,
    queried: HashSet<NodeId>,
    outstanding: usize,
}

impl FindNodeLookup {
    pub fn new(task: TaskId, target: NodeId, k: usize, seeds: Vec<Node>) -> Self {
        let mut closest = ClosestNodes::new(target, k);
        for node in seeds {
            closest.insert(node.id, node.addr);
        }
        Self {
            task,
            closest,
            queried: HashSet::new(),
            outstanding: 0,
        }
    }

    pub fn target(&self) -> &NodeId {
        self.closest.target()
    }

    /// Queries addresses whose node id we don't know yet.
    pub fn query_routers(&mut self, cx: &mut Context<'_>, routers: &[SocketAddr]) {
        let target = *self.target();
        for &addr in routers {
            match cx.send_query(Owner::Task(self.task), None, addr, DhtQuery::FindNode { target }) {
                Ok(_) => self.outstanding += 1,
                Err(e) => debug!("find_node to router {} not sent: {}", addr, e),
            }
        }
    }

    /// Queries every candidate not asked yet. Returns true once nothing is
    /// outstanding and nothing is left to ask.
    pub fn pump(&mut self, cx: &mut Context<'_>) -> bool {
        let target = *self.target();
        while let Some((id, addr)) = self.closest.next_fresh() {
            self.queried.insert(id);
            let query = DhtQuery::FindNode { target };
            match cx.send_query(Owner::Task(self.task), Some(id), addr, query) {
                Ok(_) => self.outstanding += 1,
                Err(e) => {
                    debug!("find_node to {} not sent: {}", addr, e);
                    self.closest.remove(&id);
                }
            }
        }
        self.outstanding == 0
    }

    pub fn on_outcome(
        &mut self,
        cx: &mut Context<'_>,
        txn: &Transaction,
        outcome: QueryOutcome,
    ) -> bool {
        self.outstanding = self.outstanding.saturating_sub(1);

        match outcome {
            QueryOutcome::Response(response) => {
                self.queried.insert(response.id);
                cx.learn(&response.nodes);
                for node in &response.nodes {
                    if node.id != cx.local_id && !self.queried.contains(&node.id) {
                        self.closest.insert(node.id, node.addr);
                    }
                }
            }
            QueryOutcome::Error { .. } | QueryOutcome::TimedOut => {
                if let Some(id) = txn.node_id {
                    self.closest.remove(&id);
                }
            }
        }

        self.pump(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    NotStarted,
    Querying,
    Ready,
}

/// Bootstrap: `find_node(self)` until the table is healthy or the lookup
/// runs dry. Completes even if nothing ever answers.
pub(crate) struct Initialise {
    lookup: FindNodeLookup,
    routers: Vec<SocketAddr>,
    state: InitState,
}

impl Initialise {
    pub fn new(
        task: TaskId,
        local_id: NodeId,
        k: usize,
        seeds: Vec<Node>,
        routers: Vec<SocketAddr>,
    ) -> Self {
        Self {
            lookup: FindNodeLookup::new(task, local_id, k, seeds),
            routers,
            state: InitState::NotStarted,
        }
    }

    pub fn start(&mut self, cx: &mut Context<'_>) -> Progress {
        debug_assert_eq!(self.state, InitState::NotStarted);
        self.state = InitState::Querying;

        let routers = std::mem::take(&mut self.routers);
        self.lookup.query_routers(cx, &routers);
        let exhausted = self.lookup.pump(cx);
        self.finish_if(cx, exhausted)
    }

    pub fn on_outcome(
        &mut self,
        cx: &mut Context<'_>,
        txn: &Transaction,
        outcome: QueryOutcome,
    ) -> Progress {
        let exhausted = self.lookup.on_outcome(cx, txn, outcome);
        let healthy = cx.table.count_nodes() >= cx.config.min_healthy_nodes;
        self.finish_if(cx, exhausted || healthy)
    }

    fn finish_if(&mut self, cx: &mut Context<'_>, done: bool) -> Progress {
        if !done {
            return Progress::Running;
        }
        self.state = InitState::Ready;
        info!(
            "DHT bootstrap complete, {} nodes in routing table",
            cx.table.count_nodes()
        );
        Progress::Done(TaskOutput::Initialised)
    }
}
