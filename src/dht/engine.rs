use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::config::DhtConfig;
use super::error::DhtError;
use super::message::{
    DhtMessage, DhtQuery, DhtResponse, MessageBody, TransactionId, ERROR_METHOD_UNKNOWN,
    ERROR_PROTOCOL,
};
use super::node::{decode_compact_nodes, Node, NodeState, COMPACT_NODE_LEN};
use super::node_id::NodeId;
use super::peer_store::PeerStore;
use super::routing::{Insertion, RoutingTable};
use super::task::{
    Announce, Context, FindNodeLookup, GetPeersLookup, Initialise, Progress, QueryOutcome,
    ReplaceNode, Task, TaskOutput,
};
use super::token::TokenSecrets;
use super::transaction::{Owner, TaskId, Transaction, Transactions};

/// Routing-table readiness, as seen by callers deciding whether to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtState {
    NotReady,
    Initialising,
    Ready,
}

/// Notifications raised on the engine's loop, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtEvent {
    /// Peers discovered for `info_hash`, reported as each response arrives.
    PeersFound {
        info_hash: NodeId,
        peers: Vec<SocketAddr>,
    },
    StateChanged(DhtState),
}

/// Final result of a get_peers or announce started through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub info_hash: NodeId,
    pub peers: Vec<SocketAddr>,
    /// Nodes an announce_peer was sent to; zero for plain lookups.
    pub announced_to: usize,
}

/// The DHT state machine.
///
/// `Engine` performs no I/O and reads no clock: datagrams, commands and the
/// current time are passed in, and outgoing datagrams, events and finished
/// lookups are pulled out with the `poll_*` methods. Everything lives on the
/// caller's single loop, so nothing here is shared or locked.
pub struct Engine {
    config: DhtConfig,
    local_id: NodeId,
    state: DhtState,
    table: RoutingTable,
    transactions: Transactions,
    tasks: HashMap<TaskId, Task>,
    next_task: TaskId,
    tokens: TokenSecrets,
    peer_store: PeerStore,
    outbox: VecDeque<(SocketAddr, Vec<u8>)>,
    events: VecDeque<DhtEvent>,
    finished: VecDeque<(TaskId, LookupResult)>,
    replacements: Vec<NodeId>,
    last_maintenance: Instant,
    last_token_rotation: Instant,
}

impl Engine {
    pub fn new(config: DhtConfig, now: Instant) -> Self {
        let local_id = config.node_id.unwrap_or_else(NodeId::generate);
        Self {
            local_id,
            state: DhtState::NotReady,
            table: RoutingTable::new(local_id, now),
            transactions: Transactions::new(config.query_timeout, config.max_pending_queries),
            tasks: HashMap::new(),
            next_task: 0,
            tokens: TokenSecrets::new(),
            peer_store: PeerStore::new(
                config.peer_announce_lifetime,
                config.max_peers_per_info_hash,
            ),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            finished: VecDeque::new(),
            replacements: Vec::new(),
            last_maintenance: now,
            last_token_rotation: now,
            config,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn state(&self) -> DhtState {
        self.state
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Whether `start` would have nothing but bootstrap routers to go on.
    pub fn needs_routers(&self) -> bool {
        self.table.count_nodes() == 0
    }

    /// Begins bootstrapping from the nodes already in the table, plus
    /// `routers` (addresses only) when given.
    pub fn start(&mut self, routers: Vec<SocketAddr>, now: Instant) {
        if self.state != DhtState::NotReady {
            debug!("DHT start ignored, already {:?}", self.state);
            return;
        }
        self.set_state(DhtState::Initialising);

        let seeds = self.table.get_closest(&self.local_id, self.config.k, now);
        info!(
            "starting DHT bootstrap with {} nodes and {} routers",
            seeds.len(),
            routers.len()
        );
        let task = self.allocate_task();
        let init = Initialise::new(task, self.local_id, self.config.k, seeds, routers);
        self.spawn(task, Task::Initialise(init), now);
    }

    /// Abandons every task. Late responses to their queries are ignored.
    pub fn stop(&mut self) {
        info!("stopping DHT, abandoning {} tasks", self.tasks.len());
        self.tasks.clear();
        self.transactions.clear();
        self.replacements.clear();
        self.finished.clear();
        self.table.clear_pinging();
        self.set_state(DhtState::NotReady);
    }

    /// Adds nodes from a compact node list (e.g. a saved snapshot).
    pub fn add_nodes(&mut self, compact: &[u8], now: Instant) -> Result<usize, DhtError> {
        if compact.len() % COMPACT_NODE_LEN != 0 {
            return Err(DhtError::InvalidInput(format!(
                "compact node list length {} is not a multiple of {}",
                compact.len(),
                COMPACT_NODE_LEN
            )));
        }

        let mut added = 0;
        for node in decode_compact_nodes(compact) {
            let id = node.id;
            match self.table.add(node, now) {
                Insertion::Added => added += 1,
                Insertion::ReplacementPending => self.replacements.push(id),
                Insertion::AlreadyPresent | Insertion::Rejected => {}
            }
        }
        self.spawn_replacements(now);
        Ok(added)
    }

    /// Compact list of the currently good nodes.
    pub fn save_nodes(&self, now: Instant) -> Bytes {
        self.table.save_nodes(now)
    }

    pub fn get_peers(&mut self, info_hash: NodeId, now: Instant) -> TaskId {
        let task = self.allocate_task();
        let lookup = self.lookup(task, info_hash, now);
        self.spawn(task, Task::GetPeers(lookup), now);
        task
    }

    pub fn announce(
        &mut self,
        info_hash: NodeId,
        port: u16,
        now: Instant,
    ) -> Result<TaskId, DhtError> {
        if port == 0 {
            return Err(DhtError::InvalidInput("announce port must be non-zero".into()));
        }
        let task = self.allocate_task();
        let lookup = self.lookup(task, info_hash, now);
        self.spawn(task, Task::Announce(Announce::new(lookup, port)), now);
        Ok(task)
    }

    fn lookup(&self, task: TaskId, info_hash: NodeId, now: Instant) -> GetPeersLookup {
        let seeds = self.table.get_closest(&info_hash, self.config.k, now);
        GetPeersLookup::new(task, info_hash, self.config.k, seeds)
    }

    pub fn poll_transmit(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        self.outbox.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<DhtEvent> {
        self.events.pop_front()
    }

    pub fn poll_finished(&mut self) -> Option<(TaskId, LookupResult)> {
        self.finished.pop_front()
    }

    /// When `handle_timeouts` next has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let maintenance = self.last_maintenance + self.config.maintenance_interval;
        let rotation = self.last_token_rotation + self.config.token_rotation_interval;
        let timers = maintenance.min(rotation);
        Some(match self.transactions.next_deadline() {
            Some(deadline) => deadline.min(timers),
            None => timers,
        })
    }

    pub fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        let msg = match DhtMessage::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Failed to parse DHT message from {}: {}", from, e);
                return;
            }
        };

        let tid = msg.transaction_id;
        match msg.body {
            MessageBody::Query { sender, query } => {
                self.observe(sender, from, now);
                self.answer(tid, from, query, now);
            }
            MessageBody::UnknownQuery { sender, method } => {
                self.observe(sender, from, now);
                trace!("unknown method {} from {}", method, from);
                let reply = DhtMessage::error(tid, ERROR_METHOD_UNKNOWN, "Method Unknown");
                self.outbox.push_back((from, reply.encode()));
            }
            MessageBody::Response(response) => {
                let Some(txn) = self.transactions.complete(&tid, from) else {
                    trace!("dropping unmatched response from {}", from);
                    return;
                };
                self.observe(response.id, from, now);
                self.settle(txn, QueryOutcome::Response(response), now);
            }
            MessageBody::Error { code, message } => {
                let Some(txn) = self.transactions.complete(&tid, from) else {
                    return;
                };
                debug!("{} to {} failed with {}: {}", txn.method, from, code, message);
                self.settle(txn, QueryOutcome::Error { code, message }, now);
            }
        }

        self.spawn_replacements(now);
    }

    /// Expires overdue transactions and runs periodic maintenance.
    pub fn handle_timeouts(&mut self, now: Instant) {
        for txn in self.transactions.expire(now) {
            trace!("{} to {} timed out", txn.method, txn.addr);
            self.settle(txn, QueryOutcome::TimedOut, now);
        }

        let since_rotation = now.saturating_duration_since(self.last_token_rotation);
        if since_rotation >= self.config.token_rotation_interval {
            self.last_token_rotation = now;
            self.tokens.rotate();
            debug!("DHT token secret rotated");
        }

        let since_maintenance = now.saturating_duration_since(self.last_maintenance);
        if since_maintenance >= self.config.maintenance_interval {
            self.last_maintenance = now;
            self.maintain(now);
        }

        self.spawn_replacements(now);
    }

    fn maintain(&mut self, now: Instant) {
        self.peer_store.expire(now);
        if !self.peer_store.is_empty() {
            trace!("{} announced peers held", self.peer_store.len());
        }

        if self.state != DhtState::Ready {
            return;
        }

        let stale = self.table.take_stale_buckets(self.config.bucket_refresh_interval, now);
        if !stale.is_empty() {
            debug!("Refreshing {} stale DHT buckets", stale.len());
        }
        for target in stale {
            let task = self.allocate_task();
            let seeds = self.table.get_closest(&target, self.config.k, now);
            let lookup = FindNodeLookup::new(task, target, self.config.k, seeds);
            self.spawn(task, Task::Refresh(lookup), now);
        }

        for (id, addr) in self.table.ping_candidates(now) {
            if self.replace_task_for(&id).is_some() {
                continue;
            }
            let mut cx = Context {
                table: &mut self.table,
                transactions: &mut self.transactions,
                outbox: &mut self.outbox,
                events: &mut self.events,
                replacements: &mut self.replacements,
                config: &self.config,
                local_id: self.local_id,
                now,
            };
            if cx.send_query(Owner::Liveness, Some(id), addr, DhtQuery::Ping).is_ok() {
                cx.table.set_pinging(&id, true);
            }
        }
    }

    /// Records that `id` just talked to us from `addr`.
    fn observe(&mut self, id: NodeId, addr: SocketAddr, now: Instant) {
        if id == self.local_id || self.table.mark_seen(&id, addr, now) {
            return;
        }
        let mut node = Node::new(id, addr);
        node.seen(now);
        if self.table.add(node, now) == Insertion::ReplacementPending {
            self.replacements.push(id);
        }
    }

    fn answer(&mut self, tid: TransactionId, from: SocketAddr, query: DhtQuery, now: Instant) {
        let mut response = DhtResponse::new(self.local_id);

        match query {
            DhtQuery::Ping => {}
            DhtQuery::FindNode { target } => {
                response.nodes = self.table.get_closest(&target, self.config.k, now);
            }
            DhtQuery::GetPeers { info_hash } => {
                response.token = Some(self.tokens.generate(&from));
                response.values = self.peer_store.get_peers(&info_hash, now);
                response.nodes = self.table.get_closest(&info_hash, self.config.k, now);
            }
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !self.tokens.validate(&from, &token) {
                    debug!("Rejecting announce_peer from {} - invalid token", from);
                    let reply = DhtMessage::error(tid, ERROR_PROTOCOL, "Protocol Error");
                    self.outbox.push_back((from, reply.encode()));
                    return;
                }
                let peer_port = if implied_port { from.port() } else { port };
                let peer = SocketAddr::new(from.ip(), peer_port);
                self.peer_store.add_peer(info_hash, peer, now);
                debug!("Stored announced peer {} for {}", peer, info_hash);
            }
        }

        self.outbox
            .push_back((from, DhtMessage::response(tid, response).encode()));
    }

    fn settle(&mut self, txn: Transaction, outcome: QueryOutcome, now: Instant) {
        let mut state = None;
        if let Some(id) = txn.node_id {
            match &outcome {
                QueryOutcome::TimedOut => state = self.table.mark_failed(&id, now),
                QueryOutcome::Error { .. } => self.table.set_pinging(&id, false),
                QueryOutcome::Response(_) => {}
            }
        }

        match txn.owner {
            Owner::Task(task) => {
                self.drive(task, now, |t, cx| t.on_outcome(cx, &txn, outcome));
            }
            Owner::Liveness => {
                if let (Some(NodeState::Bad), Some(id)) = (state, txn.node_id) {
                    if let Some(promoted) = self.table.replace_with_standby(&id, now) {
                        debug!("node {} stopped answering, replaced by {}", id, promoted);
                    }
                }
            }
            Owner::Detached => {}
        }
    }

    fn allocate_task(&mut self) -> TaskId {
        let id = self.next_task;
        self.next_task += 1;
        id
    }

    fn spawn(&mut self, id: TaskId, task: Task, now: Instant) {
        self.tasks.insert(id, task);
        self.drive(id, now, |t, cx| t.start(cx));
    }

    /// Runs one step of task `id`. Unknown ids (finished or abandoned tasks)
    /// are ignored.
    fn drive<F>(&mut self, id: TaskId, now: Instant, step: F)
    where
        F: FnOnce(&mut Task, &mut Context<'_>) -> Progress,
    {
        let Some(mut task) = self.tasks.remove(&id) else {
            return;
        };

        let progress = {
            let mut cx = Context {
                table: &mut self.table,
                transactions: &mut self.transactions,
                outbox: &mut self.outbox,
                events: &mut self.events,
                replacements: &mut self.replacements,
                config: &self.config,
                local_id: self.local_id,
                now,
            };
            step(&mut task, &mut cx)
        };

        match progress {
            Progress::Running => {
                self.tasks.insert(id, task);
            }
            Progress::Done(output) => self.finish(id, output),
        }
    }

    fn finish(&mut self, id: TaskId, output: TaskOutput) {
        match output {
            TaskOutput::Initialised => {
                if self.table.count_nodes() > 0 {
                    self.set_state(DhtState::Ready);
                } else {
                    warn!("DHT bootstrap reached no nodes");
                    self.set_state(DhtState::NotReady);
                }
            }
            TaskOutput::Peers { info_hash, peers } => {
                self.finished.push_back((
                    id,
                    LookupResult {
                        info_hash,
                        peers,
                        announced_to: 0,
                    },
                ));
            }
            TaskOutput::Announced {
                info_hash,
                peers,
                announced_to,
            } => {
                self.finished.push_back((
                    id,
                    LookupResult {
                        info_hash,
                        peers,
                        announced_to,
                    },
                ));
            }
            TaskOutput::Refreshed | TaskOutput::Replaced => {}
        }
    }

    fn replace_task_for(&self, id: &NodeId) -> Option<TaskId> {
        let bucket = self.table.bucket_index(id);
        self.tasks.iter().find_map(|(&task, t)| match t {
            Task::ReplaceNode(r) if self.table.bucket_index(r.anchor()) == bucket => Some(task),
            _ => None,
        })
    }

    /// Starts a ReplaceNode check for each bucket that gained a replacement,
    /// unless one is already running there.
    fn spawn_replacements(&mut self, now: Instant) {
        for id in std::mem::take(&mut self.replacements) {
            if self.table.replacement_for(&id).is_none() || self.replace_task_for(&id).is_some() {
                continue;
            }
            let task = self.allocate_task();
            self.spawn(task, Task::ReplaceNode(ReplaceNode::new(task, id)), now);
        }
    }

    fn set_state(&mut self, state: DhtState) {
        if self.state != state {
            self.state = state;
            self.events.push_back(DhtEvent::StateChanged(state));
        }
    }
}
