//! The node: cluster membership, state convergence, and repair.
//!
//! [`Node`] is the public entry point. It owns a controller that handles
//! the four protocol operations (join, hello, goodbye, get-state), reacts
//! to failure-detector events by repairing the routing state, greets its
//! leaves periodically to keep the overlay converged, and says goodbye on
//! shutdown.
//!
//! Known limitation: the keyspace is a line, not a true ring. Messages
//! still reach the numerically closest node, but keys past the edge nodes
//! take extra hops, and replication would need a real ring first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::descriptor::{Descriptor, Health};
use crate::error::{Error, Result};
use crate::health::{self, Checker, Watcher};
use crate::id::Id;
use crate::protocols::{Application, NodeRpc, Peer};
use crate::routing::next_hop;
use crate::rpc::{self, RpcClient, ServerHandler};
use crate::state::{Hello, SharedState, State};

/// ID bit width used for routing tables.
const ID_SIZE: u32 = 32;

/// Routing base used for routing tables.
const ID_BASE: u32 = 16;

/// Cadence of the convergence hello sent to every leaf.
const GREET_INTERVAL: Duration = Duration::from_secs(60);

/// Budget for one round of leaf greetings.
const GREET_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for repairing state after a peer dies.
const REPAIR_TIMEOUT: Duration = Duration::from_secs(60);

/// Budget for best-effort goodbyes during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on taint-and-retry rounds while propagating a join.
const MAX_JOIN_PROPAGATION_ATTEMPTS: usize = 32;

/// Bound on state recalculations when post-join hellos hit stale
/// acknowledgments. Every re-run refreshes the conflicting peer's state,
/// so in practice one or two suffice even under churn.
const MAX_CALCULATE_RERUNS: usize = 16;

/// Controls how a node is initialized.
#[derive(Clone, Debug)]
pub struct Config {
    /// Ring identity of this node. Must be non-zero.
    pub id: Id,
    /// Address to bind the transport on.
    pub listen_addr: String,
    /// Address shared with peers when joining. Must be reachable by them.
    pub broadcast_addr: String,
    /// Number of leaves to track, half below and half above the local id.
    /// Must be even.
    pub num_leaves: usize,
    /// Number of proximity-hint neighbors to track.
    pub num_neighbors: usize,
    /// Failure detector tuning.
    pub health: health::Config,
    /// Deadline for one cluster join attempt.
    pub join_timeout: Duration,
}

impl Config {
    /// A config with the default table sizes and probe cadence.
    pub fn new(id: Id, listen_addr: impl Into<String>, broadcast_addr: impl Into<String>) -> Self {
        Config {
            id,
            listen_addr: listen_addr.into(),
            broadcast_addr: broadcast_addr.into(),
            num_leaves: 8,
            num_neighbors: 8,
            health: health::Config::default(),
            join_timeout: Duration::from_secs(60),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id == Id(0) {
            return Err(Error::InvalidArgument("node id must be set".into()));
        }
        if self.broadcast_addr.is_empty() {
            return Err(Error::InvalidArgument("broadcast address must be set".into()));
        }
        if self.num_leaves == 0 || self.num_leaves % 2 != 0 {
            return Err(Error::InvalidArgument(
                "num_leaves must be a positive multiple of 2".into(),
            ));
        }
        if self.id > crate::id::max_for_size(ID_SIZE) {
            return Err(Error::InvalidArgument(format!(
                "node id {} does not fit in {ID_SIZE} bits",
                self.id
            )));
        }
        Ok(())
    }
}

/// A node in the overlay.
pub struct Node<N: NodeRpc = RpcClient> {
    ctrl: Arc<Controller<N>>,
    endpoint: Option<quinn::Endpoint>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Node<RpcClient> {
    /// Binds the transport and starts serving the overlay protocol.
    /// The node is not part of any cluster until [`Node::join`].
    ///
    /// A broadcast address with port 0 takes the port the transport
    /// actually bound, which pairs with an ephemeral `listen_addr`.
    pub async fn start(mut cfg: Config, app: Arc<dyn Application>) -> Result<Self> {
        cfg.validate()?;
        let listen_addr = cfg
            .listen_addr
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("invalid listen address: {e}")))?;
        let endpoint = crate::transport::bind(listen_addr)?;

        if let Ok(mut broadcast) = cfg.broadcast_addr.parse::<std::net::SocketAddr>() {
            if broadcast.port() == 0 {
                let bound = endpoint
                    .local_addr()
                    .map_err(|e| Error::Internal(format!("local address unavailable: {e}")))?;
                broadcast.set_port(bound.port());
                cfg.broadcast_addr = broadcast.to_string();
            }
        }

        let rpc = Arc::new(RpcClient::new(endpoint.clone()));

        let (ctrl, mut tasks) = Controller::spawn(cfg, rpc, app);

        let server_ctrl: Arc<dyn ServerHandler> = ctrl.clone();
        let server_endpoint = endpoint.clone();
        tasks.push(tokio::spawn(async move {
            rpc::serve(server_endpoint, server_ctrl).await;
        }));

        Ok(Node {
            ctrl,
            endpoint: Some(endpoint),
            tasks,
        })
    }

    /// The bound transport address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| Error::Internal("node has no endpoint".into()))?;
        endpoint
            .local_addr()
            .map_err(|e| Error::Internal(format!("local address unavailable: {e}")))
    }
}

impl<N: NodeRpc> Node<N> {
    /// Builds a node over an externally provided transport, without
    /// serving. The caller wires incoming requests to the controller.
    /// Used by the in-process cluster tests.
    #[cfg(test)]
    pub(crate) fn with_transport(cfg: Config, rpc: Arc<N>, app: Arc<dyn Application>) -> Result<Self> {
        cfg.validate()?;
        let (ctrl, tasks) = Controller::spawn(cfg, rpc, app);
        Ok(Node {
            ctrl,
            endpoint: None,
            tasks,
        })
    }

    /// Joins the cluster through the first responsive seed. Calling this
    /// again re-joins. An empty seed list (or one consisting of this node
    /// itself) starts a single-node cluster.
    pub async fn join(&self, seeds: &[String]) -> Result<()> {
        let mut failed = false;
        for seed in seeds {
            match self.ctrl.bootstrap(seed).await {
                Ok(()) => return Ok(()),
                // Discovering our own registration among the seeds is
                // fine; other candidates are still tried.
                Err(Error::SelfJoin) => continue,
                Err(err) => {
                    warn!(addr = %seed, %err, "failed to join node");
                    failed = true;
                }
            }
        }

        if failed {
            return Err(Error::Unavailable(
                "failed to join every seed from the join list".into(),
            ));
        }
        // No one to join: we are a single-node cluster.
        Ok(())
    }

    /// The next peer in the routing chain for `key`, and whether that peer
    /// is this node. Lets applications build their own routing schemes
    /// (for example batching by owner).
    pub fn next_peer(&self, key: Id) -> Result<(Peer, bool)> {
        self.ctrl.next_peer(key)
    }

    /// A deep copy of the current routing state, for inspection.
    pub fn state_snapshot(&self) -> State {
        self.ctrl.state.snapshot()
    }

    /// Leaves the cluster: stops health checking, tells every healthy peer
    /// goodbye on a best-effort basis, and shuts the transport down.
    pub async fn close(&mut self) -> Result<()> {
        let result = self.ctrl.close().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"closed");
        }
        result
    }

    pub(crate) fn controller(&self) -> Arc<Controller<N>> {
        self.ctrl.clone()
    }
}

/// Join bookkeeping while this node bootstraps into a cluster.
#[derive(Default)]
struct JoinProgress {
    /// Hellos received so far, in chain order.
    hellos: Vec<Hello>,
    /// Address the next hello must come from.
    next_hello: String,
    /// Completion signal back to the bootstrap caller.
    done: Option<oneshot::Sender<Result<()>>>,
}

pub(crate) struct Controller<N: NodeRpc> {
    pub(crate) state: SharedState,
    pub(crate) rpc: Arc<N>,
    pub(crate) health: Checker,
    pub(crate) app: Arc<dyn Application>,

    /// Serializes bootstrap attempts: only one join may run at a time.
    join_mutex: tokio::sync::Mutex<()>,
    /// True while this node is joining; switches hello handling over to
    /// the accumulator.
    joining: AtomicBool,
    /// Hello accumulation, serialized independently of the state mutex.
    progress: tokio::sync::Mutex<JoinProgress>,

    join_timeout: Duration,
}

struct ChannelWatcher {
    tx: mpsc::UnboundedSender<(Descriptor, Health)>,
}

#[async_trait]
impl Watcher for ChannelWatcher {
    async fn health_changed(&self, peer: Descriptor, health: Health) {
        let _ = self.tx.send((peer, health));
    }
}

impl<N: NodeRpc> Controller<N> {
    fn spawn(
        cfg: Config,
        rpc: Arc<N>,
        app: Arc<dyn Application>,
    ) -> (Arc<Self>, Vec<tokio::task::JoinHandle<()>>) {
        let node = Descriptor::new(cfg.id, cfg.broadcast_addr.clone());
        let state = SharedState::new(State::new(
            node,
            cfg.num_leaves,
            cfg.num_neighbors,
            ID_SIZE,
            ID_BASE,
        ));

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let health = Checker::new(cfg.health, rpc.clone(), Arc::new(ChannelWatcher { tx: event_tx }));

        let ctrl = Arc::new(Controller {
            state,
            rpc,
            health,
            app,
            join_mutex: tokio::sync::Mutex::new(()),
            joining: AtomicBool::new(false),
            progress: tokio::sync::Mutex::new(JoinProgress::default()),
            join_timeout: cfg.join_timeout,
        });

        let mut tasks = Vec::new();

        // Health events fan out to concurrent repair tasks; repairs for
        // different peers may overlap and rely on replace_* idempotence.
        let event_ctrl = ctrl.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((peer, health)) = event_rx.recv().await {
                let ctrl = event_ctrl.clone();
                tokio::spawn(async move {
                    ctrl.on_health_changed(peer, health).await;
                });
            }
        }));

        let greet_ctrl = ctrl.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GREET_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                greet_ctrl.greet_leaves().await;
            }
        }));

        (ctrl, tasks)
    }

    /// Joins the cluster through `seed`. Only one bootstrap runs at a
    /// time.
    pub(crate) async fn bootstrap(&self, seed: &str) -> Result<()> {
        let _guard = self.join_mutex.lock().await;

        self.joining.store(true, Ordering::SeqCst);
        let result = tokio::time::timeout(self.join_timeout, self.bootstrap_inner(seed)).await;
        self.joining.store(false, Ordering::SeqCst);

        match result {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    async fn bootstrap_inner(&self, seed: &str) -> Result<()> {
        // Learn the seed's advertised descriptor first; a discovery system
        // may well have handed us our own address.
        let seed_state = self.rpc.get_state(seed).await?;
        let local = self.state.node();
        if *seed_state.node() == local {
            return Err(Error::SelfJoin);
        }

        let done_rx = {
            let mut progress = self.progress.lock().await;
            progress.hellos.clear();
            progress.next_hello = seed_state.node().addr.clone();
            let (tx, rx) = oneshot::channel();
            progress.done = Some(tx);
            rx
        };

        info!(addr = %seed, "sending join to node");
        self.rpc.join(seed, local).await?;

        // The hello chain ends with the node closest to our id; completion
        // is signaled from the hello handler.
        done_rx.await.map_err(|_| Error::Canceled)?
    }

    /// Routes a join request for `joiner`, greeting it with our state and
    /// propagating along the routing path for its id.
    async fn join_request(&self, joiner: Descriptor) -> Result<()> {
        if joiner.addr.is_empty() {
            return Err(Error::InvalidArgument("no cluster address received".into()));
        }
        let local = self.state.node();
        if joiner == local {
            return Err(Error::InvalidArgument("node can't join itself".into()));
        }

        info!(peer = %joiner.addr, id = %joiner.id, "received join request");

        for _ in 0..MAX_JOIN_PROPAGATION_ATTEMPTS {
            let state = self.state.snapshot();

            let next = next_hop(&state, joiner.id).ok_or_else(|| {
                Error::Internal("can not find next node for join request".into())
            })?;

            // An id may only be re-used with the same address, which
            // happens when a node re-joins the cluster.
            if next.id == joiner.id && next.addr != joiner.addr {
                return Err(Error::InvalidArgument("ID already in use".into()));
            }

            let hello = Hello {
                initiator: state.node().clone(),
                next: (next != *state.node() && next != joiner).then(|| next.clone()),
                state: state.clone(),
                ack: None,
            };
            if let Err(err) = self.rpc.hello(&joiner.addr, hello).await {
                warn!(peer = %joiner.addr, %err, "failed to say hello to joining peer");
                return Err(err);
            }

            // Chain ends here when we are the closest node, or when the
            // joiner is re-joining and routes to itself.
            if next == *state.node() || next == joiner {
                return Ok(());
            }

            info!(peer = %joiner.addr, next = %next.addr, "propagating join");
            match self.rpc.join(&next.addr, joiner.clone()).await {
                Err(err) if err.is_unavailable() => {
                    // Taint the unreachable hop and pick a new route. The
                    // joiner sees our re-sent hello as a retransmit.
                    self.taint(&next).await;
                    continue;
                }
                // Other errors may be meaningful (id already in use), so
                // the hop is not tainted.
                other => return other,
            }
        }
        Err(Error::Exhausted)
    }

    async fn hello_request(&self, hello: Hello) -> Result<()> {
        let result = self.hello_request_inner(hello).await;
        // Whatever the hello did to the tables, track the current peer
        // set.
        self.sync_health_jobs().await;
        result
    }

    async fn hello_request_inner(&self, hello: Hello) -> Result<()> {
        // Don't consider the hello at all if it was built against an
        // outdated view of our state.
        if let Some(ack) = hello.ack {
            if self.state.is_newer(ack) {
                debug!(received = ack, "outdated hello acknowledgment");
                return Err(Error::StateChanged {
                    new_state: Box::new(self.state.snapshot()),
                });
            }
        }

        info!(peer = %hello.initiator.addr, peer_id = %hello.initiator.id, "got hello from peer");

        if self.joining.load(Ordering::SeqCst) {
            return self.joining_hello(hello).await;
        }

        let outcome = self.state.mixin_state(&hello.state);
        if outcome.leaves {
            self.notify_peers_changed().await;
        }
        Ok(())
    }

    /// Handles a hello while this node is joining: accumulate it, follow
    /// the chain, and complete the join once the chain ends.
    async fn joining_hello(&self, hello: Hello) -> Result<()> {
        let mut progress = self.progress.lock().await;

        if hello.initiator.addr != progress.next_hello {
            // Unexpected sender. The previous hop may legitimately re-send
            // its hello after failing to propagate; anything else is
            // dropped.
            let retransmit = progress
                .hellos
                .last()
                .map(|prev| prev.initiator == hello.initiator)
                .unwrap_or(false);
            if !retransmit {
                info!(
                    expect = %progress.next_hello,
                    got = %hello.initiator.addr,
                    "ignoring unexpected hello during join"
                );
                return Ok(());
            }
            let end = progress.hellos.len() - 1;
            progress.hellos[end] = hello;
        } else {
            progress.hellos.push(hello);
        }

        let next_addr = progress
            .hellos
            .last()
            .expect("hello chain is non-empty after append")
            .next
            .as_ref()
            .map(|next| next.addr.clone());
        if let Some(next_addr) = next_addr {
            progress.next_hello = next_addr;
            return Ok(());
        }

        info!("completing cluster join");
        let result = self.complete_join(&mut progress.hellos).await;

        self.joining.store(false, Ordering::SeqCst);
        if let Some(done) = progress.done.take() {
            let _ = done.send(result);
        }
        Ok(())
    }

    /// Calculates the initial state from the accumulated hellos and shares
    /// it with every peer, restarting the calculation when a peer reports
    /// our view of it went stale.
    async fn complete_join(&self, hellos: &mut [Hello]) -> Result<()> {
        'recalculate: for _ in 0..MAX_CALCULATE_RERUNS {
            self.state.calculate(hellos);

            let send_state = self.state.snapshot();
            for p in self.state.peers(false) {
                // If we hold state from this peer, acknowledge its version
                // so it can tell us about changes since.
                let hello_idx = hellos.iter().position(|h| h.initiator == p);
                let ack = hello_idx.map(|i| hellos[i].state.version());

                info!(peer = %p.addr, "sending join state to peer");
                let hello = Hello {
                    initiator: send_state.node().clone(),
                    next: None,
                    state: send_state.clone(),
                    ack,
                };
                match self.rpc.hello(&p.addr, hello).await {
                    Ok(()) => {}
                    Err(Error::StateChanged { new_state }) if hello_idx.is_some() => {
                        info!(peer = %p.addr, "peer state changed since join, restarting join");
                        if let Some(i) = hello_idx {
                            hellos[i].state = *new_state;
                        }
                        continue 'recalculate;
                    }
                    Err(err) => {
                        warn!(peer = %p.addr, %err, "failed to inform peer of join");
                        return Err(Error::Aborted(format!(
                            "communication with peer {} failed: {err}",
                            p.addr
                        )));
                    }
                }
            }
            return Ok(());
        }
        Err(Error::Aborted(
            "peers kept changing state during join".into(),
        ))
    }

    /// Reacts to a health transition: record it, and repair the state when
    /// a peer dies.
    async fn on_health_changed(&self, peer: Descriptor, health: Health) {
        info!(peer = %peer.addr, %health, "changing health of peer");
        self.state.set_health(peer.clone(), health);

        if health != Health::Dead {
            // Healthy restores connectivity and Unhealthy just stops
            // routing; only death requires repair.
            return;
        }

        if tokio::time::timeout(REPAIR_TIMEOUT, self.repair(&peer))
            .await
            .is_err()
        {
            warn!(peer = %peer.addr, "state repair ran out of time");
        }

        // Dead peers must not leak health jobs or pooled connections.
        self.rpc.evict(&peer.addr).await;
        self.sync_health_jobs().await;
        self.state.untrack(&peer);
    }

    async fn repair(&self, dead: &Descriptor) {
        // Work from a snapshot so recovery never holds the state lock
        // across an RPC; replace_* re-checks everything under the lock.
        let saved = self.state.snapshot();

        let is_leaf = saved.is_leaf(dead);
        let is_neighbor = saved.neighbors().contains(dead);
        let route_index = saved
            .route_index(dead)
            .filter(|&(row, col)| saved.routing().get(row, col) == Some(dead));

        if is_leaf {
            // A dead predecessor is best replaced from the smallest live
            // predecessor, which is likeliest to know a substitute. For a
            // successor the opposite end applies.
            let mut candidates = saved.leaves(false);
            if saved.successors().contains(dead) {
                candidates.reverse();
            }

            for l in candidates {
                match self.rpc.get_state(&l.addr).await {
                    Ok(donor) => {
                        self.state.replace_leaf(dead, Some(&donor));
                        break;
                    }
                    Err(err) => {
                        warn!(peer = %l.addr, %err, "could not get state from leaf candidate");
                        self.taint(&l).await;
                    }
                }
            }
            // No candidate had a replacement: drop the entry regardless.
            self.state.replace_leaf(dead, None);
        }

        if let Some((row, _)) = route_index {
            // Ask live entries in the dead peer's row for a replacement,
            // then rows below, which share an even longer prefix.
            'fix: for r in row..saved.routing().rows() {
                for entry in saved.routing().row(r) {
                    if *entry == *saved.node() || saved.health_of(entry) != Health::Healthy {
                        continue;
                    }
                    match self.rpc.get_state(&entry.addr).await {
                        Ok(donor) => {
                            let (replaced, ok) = self.state.replace_route(dead, Some(&donor));
                            if replaced || !ok {
                                break 'fix;
                            }
                        }
                        Err(err) => {
                            warn!(peer = %entry.addr, %err, "could not get state from routing row");
                            self.taint(entry).await;
                        }
                    }
                }
            }
            self.state.replace_route(dead, None);
        }

        if is_neighbor {
            for n in saved.neighbors() {
                if saved.health_of(n) != Health::Healthy {
                    continue;
                }
                match self.rpc.get_state(&n.addr).await {
                    Ok(donor) => {
                        let (changed, ok) = self.state.replace_neighbor(dead, Some(&donor));
                        if !ok || changed {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(peer = %n.addr, %err, "could not get state from neighbor candidate");
                    }
                }
            }
            self.state.replace_neighbor(dead, None);
        }

        if is_leaf {
            self.notify_peers_changed().await;
        }
    }

    async fn greet_leaves(&self) {
        info!("pinging all leaves");
        let state = self.state.snapshot();
        let round = async {
            for leaf in self.state.leaves(false) {
                let hello = Hello {
                    initiator: state.node().clone(),
                    next: None,
                    state: state.clone(),
                    ack: None,
                };
                if let Err(err) = self.rpc.hello(&leaf.addr, hello).await {
                    warn!(leaf = %leaf.addr, %err, "pinging leaf failed");
                    self.taint(&leaf).await;
                }
            }
        };
        if tokio::time::timeout(GREET_TIMEOUT, round).await.is_err() {
            warn!("leaf greeting round ran out of time");
        }
        info!("done pinging leaves");
    }

    pub(crate) fn next_peer(&self, key: Id) -> Result<(Peer, bool)> {
        let state = self.state.snapshot();
        let hop = next_hop(&state, key).ok_or_else(|| {
            Error::Internal(format!(
                "unable to find any node able to accept key {key}. THIS IS A BUG!"
            ))
        })?;
        let is_self = hop == *state.node();
        Ok((Peer::from(hop), is_self))
    }

    /// Marks `peer` Unhealthy after a failed interaction, without waiting
    /// for the next probe. The routing state is updated synchronously so a
    /// retry through next-hop selection sees the taint immediately; the
    /// checker notification follows for repair bookkeeping.
    pub(crate) async fn taint(&self, peer: &Descriptor) {
        self.state.taint(peer);
        if let Err(err) = self.health.set_health(peer, Health::Unhealthy).await {
            // The peer may already have been repaired away.
            debug!(peer = %peer.addr, %err, "could not mark node unhealthy");
        }
    }

    async fn sync_health_jobs(&self) {
        if let Err(err) = self.health.check_nodes(self.state.peers(true)).await {
            debug!(%err, "could not sync health jobs");
        }
    }

    async fn notify_peers_changed(&self) {
        let peers = self
            .state
            .leaves(true)
            .into_iter()
            .map(Peer::from)
            .collect();
        self.app.peers_changed(peers).await;
    }

    async fn close(&self) -> Result<()> {
        let mut first_err = self.health.close().await.err();

        // Tell all healthy peers we are leaving, best effort.
        let node = self.state.node();
        let goodbyes = async {
            for p in self.state.peers(false) {
                if let Err(err) = self.rpc.goodbye(&p.addr, node.clone()).await {
                    warn!(peer = %p.addr, %err, "failed to inform peer of leaving");
                    first_err.get_or_insert(err);
                }
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, goodbyes).await.is_err() {
            first_err.get_or_insert(Error::DeadlineExceeded);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<N: NodeRpc> ServerHandler for Controller<N> {
    async fn handle_join(&self, joiner: Descriptor) -> Result<()> {
        self.join_request(joiner).await
    }

    async fn handle_hello(&self, hello: Hello) -> Result<()> {
        self.hello_request(hello).await
    }

    async fn handle_goodbye(&self, leaver: Descriptor) -> Result<()> {
        info!(node = %leaver.addr, "informed of node leaving, treating as dead");
        if self.health.set_health(&leaver, Health::Dead).await.is_err() {
            warn!(node = %leaver.addr, "leaving node is not in set of peers");
        }
        Ok(())
    }

    async fn handle_get_state(&self) -> State {
        self.state.snapshot()
    }

    async fn handle_app(&self, request: crate::protocols::AppRequest) -> Result<Vec<u8>> {
        self.app_request(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::AppRequest;
    use crate::router;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-process transport: a registry of controllers addressed by their
    /// broadcast address, with per-address outage switches.
    #[derive(Clone, Default)]
    struct TestNetwork {
        nodes: Arc<Mutex<HashMap<String, Arc<Controller<TestNetwork>>>>>,
        down: Arc<Mutex<HashSet<String>>>,
    }

    impl TestNetwork {
        fn register(&self, addr: &str, ctrl: Arc<Controller<TestNetwork>>) {
            self.nodes.lock().unwrap().insert(addr.to_string(), ctrl);
        }

        fn set_down(&self, addr: &str, down: bool) {
            let mut set = self.down.lock().unwrap();
            if down {
                set.insert(addr.to_string());
            } else {
                set.remove(addr);
            }
        }

        fn target(&self, addr: &str) -> Result<Arc<Controller<TestNetwork>>> {
            if self.down.lock().unwrap().contains(addr) {
                return Err(Error::Unavailable(format!("{addr} is down")));
            }
            self.nodes
                .lock()
                .unwrap()
                .get(addr)
                .cloned()
                .ok_or_else(|| Error::Unavailable(format!("no node at {addr}")))
        }
    }

    #[async_trait]
    impl NodeRpc for TestNetwork {
        async fn join(&self, addr: &str, joiner: Descriptor) -> Result<()> {
            self.target(addr)?.handle_join(joiner).await
        }
        async fn hello(&self, addr: &str, hello: Hello) -> Result<()> {
            self.target(addr)?.handle_hello(hello).await
        }
        async fn goodbye(&self, addr: &str, leaver: Descriptor) -> Result<()> {
            self.target(addr)?.handle_goodbye(leaver).await
        }
        async fn get_state(&self, addr: &str) -> Result<State> {
            Ok(self.target(addr)?.handle_get_state().await)
        }
        async fn forward(&self, addr: &str, request: AppRequest) -> Result<Vec<u8>> {
            self.target(addr)?.handle_app(request).await
        }
        async fn evict(&self, _addr: &str) {}
    }

    /// Application that answers with its own tag and records peer-change
    /// callbacks.
    struct EchoApp {
        tag: String,
        peer_updates: Mutex<Vec<Vec<Peer>>>,
    }

    impl EchoApp {
        fn new(tag: &str) -> Arc<Self> {
            Arc::new(EchoApp {
                tag: tag.to_string(),
                peer_updates: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Application for EchoApp {
        async fn peers_changed(&self, peers: Vec<Peer>) {
            self.peer_updates.lock().unwrap().push(peers);
        }
        async fn handle_request(&self, method: &str, key: Id, body: Vec<u8>) -> Result<Vec<u8>> {
            assert_eq!(router::current_key(), Some(key));
            let mut response = format!("{}:{}:{}:", self.tag, method, key).into_bytes();
            response.extend_from_slice(&body);
            Ok(response)
        }
    }

    fn test_config(id: u128, addr: &str) -> Config {
        let mut cfg = Config::new(Id(id), "unused", addr);
        // Fast probes so failure-driven tests converge quickly.
        cfg.health = health::Config {
            check_frequency: Duration::from_millis(25),
            check_timeout: Duration::from_millis(200),
            max_failures: 1,
        };
        cfg.join_timeout = Duration::from_secs(5);
        cfg
    }

    struct TestNode {
        node: Node<TestNetwork>,
        app: Arc<EchoApp>,
    }

    fn start_node(network: &TestNetwork, id: u128, addr: &str) -> TestNode {
        let app = EchoApp::new(addr);
        let node = Node::with_transport(
            test_config(id, addr),
            Arc::new(network.clone()),
            app.clone(),
        )
        .expect("node starts");
        network.register(addr, node.controller());
        TestNode { node, app }
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn two_node_cluster_routes_to_key_owners() {
        let network = TestNetwork::default();
        let seed = start_node(&network, 0x1000_0000, "seed");
        let peer = start_node(&network, 0x9000_0000, "peer");

        peer.node.join(&["seed".to_string()]).await.expect("join");

        // Both sides know each other as leaves.
        let snapshot = peer.node.state_snapshot();
        assert!(snapshot.leaves(true).iter().any(|d| d.addr == "seed"));
        wait_until("seed learns the peer", || {
            seed.node
                .state_snapshot()
                .leaves(true)
                .iter()
                .any(|d| d.addr == "peer")
        })
        .await;

        // A key owned by the seed routes to the seed's handler from the
        // peer, and vice versa.
        let client = router::Client::new(&peer.node);
        let response = client
            .invoke("kv.Get", Id(0x1000_0001), b"question".to_vec())
            .await
            .expect("invoke");
        assert_eq!(
            String::from_utf8(response).unwrap(),
            format!("seed:kv.Get:{}:question", Id(0x1000_0001))
        );

        let client = router::Client::new(&seed.node);
        let response = client
            .invoke("kv.Get", Id(0x9000_0001), b"question".to_vec())
            .await
            .expect("invoke");
        assert_eq!(
            String::from_utf8(response).unwrap(),
            format!("peer:kv.Get:{}:question", Id(0x9000_0001))
        );
    }

    #[tokio::test]
    async fn join_through_self_is_rejected() {
        let network = TestNetwork::default();
        let node = start_node(&network, 0x1000_0000, "only");

        let err = node
            .node
            .controller()
            .bootstrap("only")
            .await
            .expect_err("self join fails");
        assert!(matches!(err, Error::SelfJoin));

        // The public join treats it as "no one to join".
        node.node
            .join(&["only".to_string()])
            .await
            .expect("single-node cluster");
    }

    #[tokio::test]
    async fn join_with_stolen_id_is_rejected() {
        let network = TestNetwork::default();
        let seed = start_node(&network, 0x1000_0000, "seed");
        let peer = start_node(&network, 0x9000_0000, "peer");
        peer.node.join(&["seed".to_string()]).await.expect("join");

        let thief = start_node(&network, 0x9000_0000, "thief");
        let err = thief
            .node
            .join(&["seed".to_string()])
            .await
            .expect_err("stolen id must be rejected");
        assert!(err.is_unavailable() || matches!(err, Error::InvalidArgument(_)));

        // The seed still only knows the original holder of the id.
        let snapshot = seed.node.state_snapshot();
        assert!(snapshot.peers(true).iter().all(|d| d.addr != "thief"));
    }

    #[tokio::test]
    async fn stale_hello_ack_returns_current_state() {
        let network = TestNetwork::default();
        let seed = start_node(&network, 0x1000_0000, "seed");
        let peer = start_node(&network, 0x9000_0000, "peer");
        peer.node.join(&["seed".to_string()]).await.expect("join");

        let ctrl = seed.node.controller();
        let old_version = 1; // Far in the past.
        let hello = Hello {
            initiator: peer.node.state_snapshot().node().clone(),
            next: None,
            state: peer.node.state_snapshot(),
            ack: Some(old_version),
        };
        match ctrl.handle_hello(hello).await {
            Err(Error::StateChanged { new_state }) => {
                assert_eq!(new_state.node().addr, "seed");
            }
            other => panic!("expected StateChanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn goodbye_repairs_the_leaf_set() {
        let network = TestNetwork::default();
        let a = start_node(&network, 0x1000_0000, "a");
        let b = start_node(&network, 0x5000_0000, "b");
        let c = start_node(&network, 0x9000_0000, "c");
        b.node.join(&["a".to_string()]).await.expect("b joins");
        c.node.join(&["a".to_string()]).await.expect("c joins");

        wait_until("a sees both peers as leaves", || {
            let leaves = a.node.state_snapshot().leaves(true);
            leaves.iter().any(|d| d.addr == "b") && leaves.iter().any(|d| d.addr == "c")
        })
        .await;

        // b leaves; a treats it as dead and repairs it away.
        network.set_down("b", true);
        a.node
            .controller()
            .handle_goodbye(b.node.state_snapshot().node().clone())
            .await
            .expect("goodbye");

        wait_until("a repairs b out of its leaves", || {
            let snapshot = a.node.state_snapshot();
            snapshot.leaves(true).iter().all(|d| d.addr != "b")
                && snapshot.peers(true).iter().all(|d| d.addr != "b")
        })
        .await;

        // The repair reported a peer change.
        wait_until("peers_changed fired", || {
            !a.app.peer_updates.lock().unwrap().is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn forwarder_taints_dead_hops_and_reroutes() {
        let network = TestNetwork::default();
        let seed = start_node(&network, 0x1000_0000, "seed");
        let peer = start_node(&network, 0x9000_0000, "peer");
        peer.node.join(&["seed".to_string()]).await.expect("join");
        wait_until("seed learns the peer", || {
            seed.node
                .state_snapshot()
                .leaves(true)
                .iter()
                .any(|d| d.addr == "peer")
        })
        .await;

        network.set_down("peer", true);

        // Routing a key owned by the dead peer falls back to the closest
        // live node (the seed itself) after tainting.
        let client = router::Client::new(&seed.node);
        let response = client
            .invoke("kv.Get", Id(0x9000_0001), b"q".to_vec())
            .await
            .expect("rerouted invoke");
        assert!(String::from_utf8(response).unwrap().starts_with("seed:"));

        // The dead hop is either tainted or already repaired out of the
        // state entirely, depending on how far the background probes got.
        let snapshot = seed.node.state_snapshot();
        let peer_desc = Descriptor::new(Id(0x9000_0000), "peer");
        let still_routable = snapshot.peers(true).contains(&peer_desc)
            && snapshot.health_of(&peer_desc) == Health::Healthy;
        assert!(!still_routable);
    }

    #[tokio::test]
    async fn forwarded_requests_require_a_routing_key() {
        let network = TestNetwork::default();
        let node = start_node(&network, 0x1000_0000, "only");
        let ctrl = node.node.controller();

        let missing = AppRequest {
            method: "kv.Get".into(),
            metadata: vec![],
            body: vec![],
        };
        assert!(matches!(
            ctrl.handle_app(missing).await,
            Err(Error::InvalidArgument(_))
        ));

        let malformed = AppRequest {
            method: "kv.Get".into(),
            metadata: vec![(router::REQUEST_ID_HEADER.to_string(), "not-a-number".into())],
            body: vec![],
        };
        assert!(matches!(
            ctrl.handle_app(malformed).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn close_sends_goodbyes() {
        let network = TestNetwork::default();
        let seed = start_node(&network, 0x1000_0000, "seed");
        let mut peer = start_node(&network, 0x9000_0000, "peer");
        peer.node.join(&["seed".to_string()]).await.expect("join");
        wait_until("seed learns the peer", || {
            seed.node
                .state_snapshot()
                .leaves(true)
                .iter()
                .any(|d| d.addr == "peer")
        })
        .await;

        peer.node.close().await.expect("close");

        wait_until("seed repairs the leaver away", || {
            seed.node
                .state_snapshot()
                .peers(true)
                .iter()
                .all(|d| d.addr != "peer")
        })
        .await;
    }
}
