use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::config::DhtConfig;
use super::engine::{DhtEvent, DhtState, Engine, LookupResult};
use super::error::DhtError;
use super::node_id::NodeId;
use super::transaction::TaskId;

const MAX_DATAGRAM: usize = 65535;

enum Command {
    Start {
        initial_nodes: Vec<u8>,
        reply: oneshot::Sender<Result<(), DhtError>>,
    },
    Stop,
    GetPeers {
        info_hash: NodeId,
        reply: oneshot::Sender<Result<LookupResult, DhtError>>,
    },
    Announce {
        info_hash: NodeId,
        port: u16,
        reply: oneshot::Sender<Result<LookupResult, DhtError>>,
    },
    AddNodes {
        compact: Vec<u8>,
        reply: oneshot::Sender<Result<usize, DhtError>>,
    },
    SaveNodes {
        reply: oneshot::Sender<Bytes>,
    },
}

/// Handle to a running DHT node.
///
/// `DhtServer` implements the BitTorrent DHT protocol ([BEP-5]) for finding
/// peers without relying on trackers. Binding spawns a driver task that owns
/// the UDP socket and the routing table; the handle only sends it commands,
/// so it is cheap to clone and share. The driver exits once every handle is
/// dropped.
///
/// # Examples
///
/// ```no_run
/// use rbit_dht::dht::{DhtConfig, DhtEvent, DhtServer};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (dht, mut events) = DhtServer::bind(DhtConfig::default()).await?;
///
/// // Bootstrap from the well-known routers
/// dht.start(&[]).await?;
///
/// // Find peers for a torrent
/// let info_hash = [0u8; 20];
/// let peers = dht.get_peers(&info_hash).await?;
///
/// while let Some(event) = events.recv().await {
///     if let DhtEvent::PeersFound { peers, .. } = event {
///         println!("found {} peers", peers.len());
///     }
/// }
/// # Ok(())
/// # }
/// ```
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
#[derive(Clone)]
pub struct DhtServer {
    local_id: NodeId,
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<DhtState>,
}

impl DhtServer {
    /// Binds the socket and spawns the driver. Events are delivered, in the
    /// order the engine raised them, on the returned receiver.
    pub async fn bind(
        config: DhtConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DhtEvent>), DhtError> {
        let socket = UdpSocket::bind(config.listen_addr).await?;
        let local_addr = socket.local_addr()?;
        let engine = Engine::new(config, Instant::now());
        let local_id = *engine.local_id();

        info!("DHT server bound to {} with id {}", local_addr, local_id);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(engine.state());

        let driver = Driver {
            engine,
            socket,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            lookups: HashMap::new(),
            resolving: None,
        };
        tokio::spawn(driver.run());

        Ok((
            Self {
                local_id,
                local_addr,
                commands: command_tx,
                state: state_rx,
            },
            event_rx,
        ))
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn state(&self) -> DhtState {
        *self.state.borrow()
    }

    /// Starts bootstrapping. `initial_nodes` is a compact node list (for
    /// example a previous [`save_nodes`](Self::save_nodes)); when it and the
    /// routing table are empty the configured routers are resolved instead.
    pub async fn start(&self, initial_nodes: &[u8]) -> Result<(), DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start {
            initial_nodes: initial_nodes.to_vec(),
            reply,
        })?;
        rx.await.map_err(|_| DhtError::Stopped)?
    }

    /// Abandons every running lookup; their callers get [`DhtError::Stopped`].
    pub fn stop(&self) -> Result<(), DhtError> {
        self.send(Command::Stop)
    }

    /// Runs a get_peers lookup to completion. Peers are also reported as they
    /// arrive through [`DhtEvent::PeersFound`].
    pub async fn get_peers(&self, info_hash: &[u8]) -> Result<Vec<SocketAddr>, DhtError> {
        let info_hash = NodeId::from_bytes(info_hash)?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetPeers { info_hash, reply })?;
        let result = rx.await.map_err(|_| DhtError::Stopped)??;
        Ok(result.peers)
    }

    /// Looks up `info_hash` and announces `port` to the closest nodes that
    /// handed out a token. Returns how many nodes were announced to.
    pub async fn announce(&self, info_hash: &[u8], port: u16) -> Result<usize, DhtError> {
        let info_hash = NodeId::from_bytes(info_hash)?;
        if port == 0 {
            return Err(DhtError::InvalidInput("announce port must be non-zero".into()));
        }
        let (reply, rx) = oneshot::channel();
        self.send(Command::Announce {
            info_hash,
            port,
            reply,
        })?;
        let result = rx.await.map_err(|_| DhtError::Stopped)??;
        Ok(result.announced_to)
    }

    pub async fn add_nodes(&self, compact: &[u8]) -> Result<usize, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AddNodes {
            compact: compact.to_vec(),
            reply,
        })?;
        rx.await.map_err(|_| DhtError::Stopped)?
    }

    /// Compact node list of the good nodes in the routing table.
    pub async fn save_nodes(&self) -> Result<Bytes, DhtError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SaveNodes { reply })?;
        rx.await.map_err(|_| DhtError::Stopped)
    }

    fn send(&self, command: Command) -> Result<(), DhtError> {
        self.commands.send(command).map_err(|_| DhtError::Stopped)
    }
}

/// The single task that owns the engine.
struct Driver {
    engine: Engine,
    socket: UdpSocket,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<DhtEvent>,
    state: watch::Sender<DhtState>,
    lookups: HashMap<TaskId, oneshot::Sender<Result<LookupResult, DhtError>>>,
    resolving: Option<oneshot::Receiver<Vec<SocketAddr>>>,
}

enum Input {
    Datagram(std::io::Result<(usize, SocketAddr)>),
    Command(Option<Command>),
    Routers(Vec<SocketAddr>),
    Tick,
}

impl Driver {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let deadline = self
                .engine
                .next_deadline()
                .map(tokio::time::Instant::from_std);

            let input = tokio::select! {
                result = self.socket.recv_from(&mut buf) => Input::Datagram(result),
                command = self.commands.recv() => Input::Command(command),
                routers = resolved(&mut self.resolving) => Input::Routers(routers),
                _ = sleep_until(deadline) => Input::Tick,
            };

            let now = Instant::now();
            match input {
                Input::Datagram(Ok((n, from))) => {
                    self.engine.handle_datagram(from, &buf[..n], now);
                }
                Input::Datagram(Err(e)) => {
                    warn!("DHT socket failed: {}", e);
                    break;
                }
                Input::Command(Some(command)) => self.handle_command(command, now),
                Input::Command(None) => {
                    debug!("all DHT handles dropped, shutting down");
                    break;
                }
                Input::Routers(routers) => {
                    self.resolving = None;
                    self.engine.start(routers, now);
                }
                Input::Tick => self.engine.handle_timeouts(now),
            }

            self.flush().await;
        }
    }

    fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Start {
                initial_nodes,
                reply,
            } => {
                if let Err(e) = self.engine.add_nodes(&initial_nodes, now) {
                    let _ = reply.send(Err(e));
                    return;
                }
                if self.resolving.is_some() {
                    let _ = reply.send(Ok(()));
                    return;
                }

                if self.engine.needs_routers() {
                    let routers = self.engine.config().bootstrap_routers.clone();
                    let (tx, rx) = oneshot::channel();
                    tokio::spawn(async move {
                        let _ = tx.send(resolve_routers(&routers).await);
                    });
                    self.resolving = Some(rx);
                } else {
                    self.engine.start(Vec::new(), now);
                }
                let _ = reply.send(Ok(()));
            }
            Command::Stop => {
                self.resolving = None;
                self.engine.stop();
                // Dropping the reply senders tells the callers we stopped.
                self.lookups.clear();
            }
            Command::GetPeers { info_hash, reply } => {
                let task = self.engine.get_peers(info_hash, now);
                self.lookups.insert(task, reply);
            }
            Command::Announce {
                info_hash,
                port,
                reply,
            } => match self.engine.announce(info_hash, port, now) {
                Ok(task) => {
                    self.lookups.insert(task, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::AddNodes { compact, reply } => {
                let _ = reply.send(self.engine.add_nodes(&compact, now));
            }
            Command::SaveNodes { reply } => {
                let _ = reply.send(self.engine.save_nodes(now));
            }
        }
    }

    async fn flush(&mut self) {
        while let Some((addr, data)) = self.engine.poll_transmit() {
            trace!("sending {} bytes to {}", data.len(), addr);
            if let Err(e) = self.socket.send_to(&data, addr).await {
                debug!("Failed to send DHT message to {}: {}", addr, e);
            }
        }

        while let Some(event) = self.engine.poll_event() {
            if let DhtEvent::StateChanged(state) = event {
                self.state.send_replace(state);
            }
            let _ = self.events.send(event);
        }

        while let Some((task, result)) = self.engine.poll_finished() {
            if let Some(reply) = self.lookups.remove(&task) {
                let _ = reply.send(Ok(result));
            }
        }
    }
}

async fn resolved(resolving: &mut Option<oneshot::Receiver<Vec<SocketAddr>>>) -> Vec<SocketAddr> {
    match resolving {
        Some(rx) => rx.await.unwrap_or_default(),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn resolve_routers(routers: &[String]) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for router in routers {
        match tokio::net::lookup_host(router.as_str()).await {
            Ok(resolved) => {
                if let Some(addr) = resolved.into_iter().find(SocketAddr::is_ipv4) {
                    debug!("Resolved bootstrap node {} to {}", router, addr);
                    addrs.push(addr);
                }
            }
            Err(e) => {
                warn!("Failed to resolve bootstrap node {}: {}", router, e);
            }
        }
    }
    addrs
}
