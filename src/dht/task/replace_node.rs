use std::collections::HashSet;
use std::net::SocketAddr;

use tracing::{debug, trace};

use super::{Context, Progress, QueryOutcome, TaskOutput};
use crate::dht::message::DhtQuery;
use crate::dht::node::NodeState;
use crate::dht::node_id::NodeId;
use crate::dht::transaction::{Owner, TaskId, Transaction};

/// Liveness check for a full bucket with a replacement waiting.
///
/// Each round looks at the member seen longest ago that has not answered
/// this check yet. If even that one was seen within the recency window the
/// bucket is healthy and the replacement is dropped. Otherwise it is pinged:
/// any answer (response or KRPC error) moves the check on to the next member,
/// silence is retried until the node turns bad, at which point the
/// replacement takes its slot. Every round either ends the task, adds a
/// member to `answered`, or brings one closer to bad, so it terminates.
pub(crate) struct ReplaceNode {
    task: TaskId,
    /// Any id inside the bucket being checked; used to find it again after splits.
    anchor: NodeId,
    in_flight: Option<NodeId>,
    answered: HashSet<NodeId>,
}

impl ReplaceNode {
    pub fn new(task: TaskId, anchor: NodeId) -> Self {
        Self {
            task,
            anchor,
            in_flight: None,
            answered: HashSet::new(),
        }
    }

    pub fn anchor(&self) -> &NodeId {
        &self.anchor
    }

    pub fn step(&mut self, cx: &mut Context<'_>) -> Progress {
        if cx.table.replacement_for(&self.anchor).is_none() {
            return Progress::Done(TaskOutput::Replaced);
        }

        let oldest = cx
            .table
            .oldest_in_bucket(&self.anchor)
            .into_iter()
            .find(|n| !self.answered.contains(&n.id))
            .map(|n| (n.id, n.addr, n.last_seen()));

        let recent = match oldest {
            None => true,
            Some((_, _, last_seen)) => last_seen.is_some_and(|seen| {
                cx.now.saturating_duration_since(seen) < cx.config.replace_recency_window
            }),
        };
        if recent {
            trace!("bucket of {} is alive, dropping replacement", self.anchor);
            cx.table.discard_replacement(&self.anchor);
            return Progress::Done(TaskOutput::Replaced);
        }

        match oldest {
            Some((id, addr, _)) => self.ping(cx, id, addr),
            None => Progress::Done(TaskOutput::Replaced),
        }
    }

    fn ping(&mut self, cx: &mut Context<'_>, id: NodeId, addr: SocketAddr) -> Progress {
        match cx.send_query(Owner::Task(self.task), Some(id), addr, DhtQuery::Ping) {
            Ok(_) => {
                cx.table.set_pinging(&id, true);
                self.in_flight = Some(id);
                Progress::Running
            }
            Err(e) => {
                debug!("liveness ping to {} not sent: {}", addr, e);
                Progress::Done(TaskOutput::Replaced)
            }
        }
    }

    pub fn on_outcome(
        &mut self,
        cx: &mut Context<'_>,
        txn: &Transaction,
        outcome: QueryOutcome,
    ) -> Progress {
        let Some(pinged) = self.in_flight.take() else {
            return self.step(cx);
        };

        match outcome {
            QueryOutcome::Response(_) | QueryOutcome::Error { .. } => {
                self.answered.insert(pinged);
                self.step(cx)
            }
            QueryOutcome::TimedOut => {
                let state = cx.table.find_node(&pinged).map(|n| n.state(cx.now));
                match state {
                    Some(NodeState::Bad) => {
                        if let Some(promoted) = cx.table.replace_with_standby(&pinged, cx.now) {
                            debug!("node {} evicted in favour of {}", pinged, promoted);
                        }
                        Progress::Done(TaskOutput::Replaced)
                    }
                    Some(_) => self.ping(cx, pinged, txn.addr),
                    None => self.step(cx),
                }
            }
        }
    }
}
