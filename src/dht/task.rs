//! Lookup and maintenance state machines.
//!
//! Tasks never block: each one sends queries through a [`Context`] and is
//! advanced again when one of its transactions settles. The engine owns all
//! tasks and drives them one event at a time.

mod announce;
mod closest;
mod find_node;
mod get_peers;
mod replace_node;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::trace;

use super::config::DhtConfig;
use super::error::DhtError;
use super::message::{DhtMessage, DhtQuery, DhtResponse, TransactionId};
use super::node::Node;
use super::node_id::NodeId;
use super::routing::{Insertion, RoutingTable};
use super::transaction::{Owner, Transaction, Transactions};
use super::DhtEvent;

pub(crate) use announce::Announce;
pub(crate) use closest::ClosestNodes;
pub(crate) use find_node::{FindNodeLookup, Initialise};
pub(crate) use get_peers::GetPeersLookup;
pub(crate) use replace_node::ReplaceNode;

/// How a query ended, from the point of view of the task that sent it.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Response(DhtResponse),
    Error { code: i64, message: String },
    TimedOut,
}

pub(crate) enum Progress {
    Running,
    Done(TaskOutput),
}

pub(crate) enum TaskOutput {
    Initialised,
    Refreshed,
    Peers {
        info_hash: NodeId,
        peers: Vec<SocketAddr>,
    },
    Announced {
        info_hash: NodeId,
        peers: Vec<SocketAddr>,
        announced_to: usize,
    },
    Replaced,
}

/// Everything a task may touch while it runs.
pub(crate) struct Context<'a> {
    pub table: &'a mut RoutingTable,
    pub transactions: &'a mut Transactions,
    pub outbox: &'a mut VecDeque<(SocketAddr, Vec<u8>)>,
    pub events: &'a mut VecDeque<DhtEvent>,
    /// Ids whose bucket now has a replacement waiting for a liveness check.
    pub replacements: &'a mut Vec<NodeId>,
    pub config: &'a DhtConfig,
    pub local_id: NodeId,
    pub now: Instant,
}

impl Context<'_> {
    pub fn send_query(
        &mut self,
        owner: Owner,
        node_id: Option<NodeId>,
        addr: SocketAddr,
        query: DhtQuery,
    ) -> Result<TransactionId, DhtError> {
        let tid = self
            .transactions
            .begin(addr, node_id, query.method(), owner, self.now)?;
        trace!("sending {} to {}", query.method(), addr);
        let msg = DhtMessage::query(tid.clone(), self.local_id, query);
        self.outbox.push_back((addr, msg.encode()));
        Ok(tid)
    }

    /// Adds nodes learned from a response to the routing table.
    pub fn learn(&mut self, nodes: &[Node]) {
        for node in nodes {
            if self.table.add(node.clone(), self.now) == Insertion::ReplacementPending {
                self.replacements.push(node.id);
            }
        }
    }
}

pub(crate) enum Task {
    Initialise(Initialise),
    Refresh(FindNodeLookup),
    GetPeers(GetPeersLookup),
    Announce(Announce),
    ReplaceNode(ReplaceNode),
}

impl Task {
    pub fn start(&mut self, cx: &mut Context<'_>) -> Progress {
        match self {
            Task::Initialise(t) => t.start(cx),
            Task::Refresh(t) => match t.pump(cx) {
                true => Progress::Done(TaskOutput::Refreshed),
                false => Progress::Running,
            },
            Task::GetPeers(t) => t.start(cx),
            Task::Announce(t) => t.start(cx),
            Task::ReplaceNode(t) => t.step(cx),
        }
    }

    pub fn on_outcome(
        &mut self,
        cx: &mut Context<'_>,
        txn: &Transaction,
        outcome: QueryOutcome,
    ) -> Progress {
        match self {
            Task::Initialise(t) => t.on_outcome(cx, txn, outcome),
            Task::Refresh(t) => match t.on_outcome(cx, txn, outcome) {
                true => Progress::Done(TaskOutput::Refreshed),
                false => Progress::Running,
            },
            Task::GetPeers(t) => t.on_outcome(cx, txn, outcome),
            Task::Announce(t) => t.on_outcome(cx, txn, outcome),
            Task::ReplaceNode(t) => t.on_outcome(cx, txn, outcome),
        }
    }
}

#[cfg(test)]
mod tests;
