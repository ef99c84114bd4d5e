use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::error::DhtError;
use super::message::TransactionId;
use super::node_id::NodeId;

pub type TaskId = u64;

/// Who gets told when a transaction settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Task(TaskId),
    /// Maintenance ping of a questionable node.
    Liveness,
    /// Fire-and-forget; the response only refreshes the sender.
    Detached,
}

/// An outstanding query.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub addr: SocketAddr,
    /// Unknown for bootstrap routers, which are contacted by address only.
    pub node_id: Option<NodeId>,
    pub method: &'static str,
    pub owner: Owner,
    pub sent_at: Instant,
    pub deadline: Instant,
}

/// Pending-query table keyed by transaction id.
///
/// Every transaction leaves the table exactly once: through
/// [`complete`](Self::complete) when a response or error arrives, or through
/// [`expire`](Self::expire) when its deadline passes.
pub struct Transactions {
    next_id: u16,
    pending: HashMap<TransactionId, Transaction>,
    timeout: Duration,
    max_pending: usize,
}

impl Transactions {
    pub fn new(timeout: Duration, max_pending: usize) -> Self {
        Self {
            next_id: rand::random(),
            pending: HashMap::new(),
            timeout,
            max_pending,
        }
    }

    fn fresh_id(&mut self) -> TransactionId {
        loop {
            let id = Bytes::copy_from_slice(&self.next_id.to_be_bytes());
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn begin(
        &mut self,
        addr: SocketAddr,
        node_id: Option<NodeId>,
        method: &'static str,
        owner: Owner,
        now: Instant,
    ) -> Result<TransactionId, DhtError> {
        if self.pending.len() >= self.max_pending {
            return Err(DhtError::TooManyPending);
        }

        let id = self.fresh_id();
        self.pending.insert(
            id.clone(),
            Transaction {
                id: id.clone(),
                addr,
                node_id,
                method,
                owner,
                sent_at: now,
                deadline: now + self.timeout,
            },
        );
        Ok(id)
    }

    /// Settles the transaction `id` if it is pending and was sent to `from`.
    pub fn complete(&mut self, id: &[u8], from: SocketAddr) -> Option<Transaction> {
        match self.pending.get(id) {
            Some(t) if t.addr == from => self.pending.remove(id),
            _ => None,
        }
    }

    /// Removes and returns every transaction whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Transaction> {
        let expired: Vec<TransactionId> = self
            .pending
            .values()
            .filter(|t| t.deadline <= now)
            .map(|t| t.id.clone())
            .collect();

        let mut out: Vec<Transaction> = expired
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        out.sort_by_key(|t| t.deadline);
        out
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|t| t.deadline).min()
    }

    /// Number of queries `owner` still has in flight.
    pub fn outstanding(&self, owner: Owner) -> usize {
        self.pending.values().filter(|t| t.owner == owner).count()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
