//! The discovery protocol: refresh loops, message handlers, recursive search,
//! and peer-visibility masking on top of a [`Dht`].
//!
//! The hosting node feeds connection events and decoded messages into a
//! [`DiscoveryNode`]; everything the protocol sends goes back out through the
//! [`DiscoveryNetwork`] it was built with.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::DiscoveryConfig;
use crate::core::{Contact, NodeId};
use crate::dht::Dht;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::protocol::{
    Addr, FindNodeReq, FindNodeResp, Message, NodeAddr, MAX_CLOSER_PEERS, MAX_NODE_ADDRS,
};
use crate::routing::{LogObserver, RoutingObserver};

// ─────────────────────────────────────────────────────────────────────────────
// Network Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A connected peer as seen by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: NodeId,
    /// Remote socket address of the connection.
    pub addr: SocketAddr,
    /// Address the peer accepts connections on, `host:port`.
    pub listen_addr: String,
    /// Address-only peer: it is asked for addresses instead of FindNode.
    pub pseudo: bool,
}

impl PeerInfo {
    pub fn new(id: NodeId, addr: SocketAddr, listen_addr: impl Into<String>) -> Self {
        Self {
            id,
            addr,
            listen_addr: listen_addr.into(),
            pseudo: false,
        }
    }

    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.listen_addr.clone())
    }
}

/// Transport seam consumed by the discovery protocol.
///
/// Implementations must be cheap to call concurrently; `send_to` and
/// `connect` failures are logged by the caller and never retried.
#[async_trait]
pub trait DiscoveryNetwork: Send + Sync + 'static {
    /// Identifier of the local node.
    fn local_id(&self) -> NodeId;

    /// Address other peers should use to reach the local node.
    fn listen_addr(&self) -> String;

    /// The connected peer with this identifier, if any.
    fn get_peer(&self, id: &NodeId) -> Option<PeerInfo>;

    /// Deliver a message to a connected peer.
    async fn send_to(&self, to: &NodeId, msg: Message) -> Result<()>;

    /// Dial a peer by `host:port`. A successful connect is reported back
    /// through [`DiscoveryNode::on_peer_connected`].
    async fn connect(&self, addr: &str) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Recursive Search
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SearchPeers {
    visited: HashSet<NodeId>,
    todo: HashSet<NodeId>,
}

/// State of one outstanding multi-hop lookup.
pub struct RecurSearch {
    target: NodeId,
    peers: Mutex<SearchPeers>,
    result: Mutex<Option<oneshot::Sender<String>>>,
    started: Instant,
}

impl RecurSearch {
    pub fn new(target: NodeId) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let search = Self {
            target,
            peers: Mutex::new(SearchPeers::default()),
            result: Mutex::new(Some(tx)),
            started: Instant::now(),
        };
        (search, rx)
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Mark `id` visited. Only the first caller for a given id gets `true`.
    pub fn try_insert(&self, id: NodeId) -> bool {
        let mut peers = self.peers.lock();
        if !peers.visited.insert(id) {
            return false;
        }
        peers.todo.remove(&id);
        true
    }

    /// Remember a peer to query once it becomes reachable.
    pub fn add_todo(&self, id: NodeId) {
        let mut peers = self.peers.lock();
        if !peers.visited.contains(&id) {
            peers.todo.insert(id);
        }
    }

    pub fn has_todo(&self, id: &NodeId) -> bool {
        self.peers.lock().todo.contains(id)
    }

    pub fn is_visited(&self, id: &NodeId) -> bool {
        self.peers.lock().visited.contains(id)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Deliver the result. Returns false if it was already delivered or the
    /// receiver is gone.
    fn complete(&self, address: String) -> bool {
        match self.result.lock().take() {
            Some(tx) => tx.send(address).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for RecurSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers = self.peers.lock();
        f.debug_struct("RecurSearch")
            .field("target", &hex::encode(self.target))
            .field("visited", &peers.visited.len())
            .field("todo", &peers.todo.len())
            .field("elapsed", &self.started.elapsed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

struct Discovery<N: DiscoveryNetwork> {
    local: NodeId,
    dht: Dht,
    network: Arc<N>,
    mask: HashSet<IpAddr>,
    searches: RwLock<HashMap<NodeId, Arc<RecurSearch>>>,
    search_sweep_interval: Duration,
    search_stale_after: Duration,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<N: DiscoveryNetwork> Discovery<N> {
    fn alpha(&self) -> usize {
        self.dht.config().alpha
    }

    // ── connection events ───────────────────────────────────────────────────

    async fn on_peer_connected(&self, info: &PeerInfo) {
        let network = &self.network;
        let stored = self
            .dht
            .update_or_evict(info.contact(), |id| network.get_peer(id).is_some());
        trace!(peer = %hex::encode(info.id), stored, "peer connected");

        let targets: Vec<NodeId> = {
            let searches = self.searches.read();
            searches
                .iter()
                .filter(|(target, search)| {
                    (search.has_todo(&info.id) || **target == info.id)
                        && search.try_insert(info.id)
                })
                .map(|(target, _)| *target)
                .collect()
        };
        for target in targets {
            debug!(
                peer = %hex::encode(info.id),
                target = %hex::encode(target),
                "continuing recursive search with newly connected peer"
            );
            self.send(&info.id, find_node(target, true)).await;
        }
    }

    fn on_peer_disconnected(&self, info: &PeerInfo) {
        self.dht.remove(&info.id);
    }

    // ── message handlers ────────────────────────────────────────────────────

    async fn handle_message(&self, from: &PeerInfo, msg: Message) {
        trace!(peer = %hex::encode(from.id), kind = msg.kind(), "discovery message");
        match msg {
            Message::FindNodeReq(req) => self.handle_find_node_req(from, req).await,
            Message::FindNodeResp(resp) => self.handle_find_node_resp(from, resp).await,
            Message::AddrReq => self.handle_addr_req(from).await,
            Message::Addr(addr) => self.handle_addr(addr),
        }
    }

    async fn handle_find_node_req(&self, from: &PeerInfo, req: FindNodeReq) {
        let resp = if req.target == self.local {
            // The requester is already connected to us and uses the address
            // it observed for this connection.
            FindNodeResp {
                target: req.target,
                recursive: req.recursive,
                success: true,
                address: String::new(),
                closer_peers: Vec::new(),
            }
        } else {
            let mut closer = self.dht.better_peers(&req.target, self.alpha());
            if self.should_mask(from) {
                closer.retain(|peer| !self.is_masked_addr(&peer.addr));
            }
            closer.truncate(MAX_CLOSER_PEERS);
            debug!(
                peer = %hex::encode(from.id),
                target = %hex::encode(req.target),
                closer = closer.len(),
                "answering find node"
            );
            FindNodeResp {
                target: req.target,
                recursive: req.recursive,
                success: false,
                address: String::new(),
                closer_peers: closer,
            }
        };
        self.send(&from.id, Message::FindNodeResp(resp)).await;
    }

    async fn handle_find_node_resp(&self, from: &PeerInfo, resp: FindNodeResp) {
        if resp.success {
            if resp.recursive {
                let address = if resp.address.is_empty() {
                    from.listen_addr.clone()
                } else {
                    resp.address
                };
                self.complete_search(&resp.target, address);
            }
            return;
        }

        if resp.recursive {
            let search = self.searches.read().get(&resp.target).cloned();
            if let Some(search) = search {
                let mut ready = Vec::new();
                for peer in &resp.closer_peers {
                    if peer.id == self.local {
                        continue;
                    }
                    if self.network.get_peer(&peer.id).is_none() {
                        search.add_todo(peer.id);
                        continue;
                    }
                    if search.try_insert(peer.id) {
                        ready.push(peer.id);
                    }
                }
                for id in ready {
                    self.send(&id, find_node(resp.target, true)).await;
                }
            }
        }

        for peer in resp.closer_peers {
            if peer.id == self.local || self.network.get_peer(&peer.id).is_some() {
                continue;
            }
            debug!(peer = %hex::encode(peer.id), addr = %peer.addr, "connecting to closer peer");
            self.spawn_connect(peer.addr);
        }
    }

    async fn handle_addr_req(&self, from: &PeerInfo) {
        let mask = self.should_mask(from);
        let node_addrs: Vec<NodeAddr> = self
            .dht
            .list_peers()
            .into_iter()
            .filter_map(|peer| {
                let addr = peer.addr.parse::<SocketAddr>().ok()?;
                Some(NodeAddr::from_socket_addr(peer.id, addr))
            })
            .filter(|node| !mask || !self.mask.contains(&node.ip_addr()))
            .take(MAX_NODE_ADDRS)
            .collect();
        self.send(&from.id, Message::Addr(Addr { node_addrs })).await;
    }

    fn handle_addr(&self, msg: Addr) {
        for node in msg.node_addrs {
            if node.port == 0 || node.id == self.local || self.dht.contains(&node.id) {
                continue;
            }
            let addr = node.socket_addr().to_string();
            debug!(peer = %hex::encode(node.id), %addr, "connecting to advertised peer");
            self.spawn_connect(addr);
        }
    }

    // ── masking ─────────────────────────────────────────────────────────────

    /// Mask members see everyone; everyone else has mask members hidden.
    fn should_mask(&self, requester: &PeerInfo) -> bool {
        !self.mask.is_empty() && !self.mask.contains(&requester.addr.ip().to_canonical())
    }

    /// Addresses that are not `host:port` are treated as masked. Hostnames
    /// never match the mask.
    fn is_masked_addr(&self, addr: &str) -> bool {
        match split_host(addr) {
            Some(host) => host
                .parse::<IpAddr>()
                .is_ok_and(|ip| self.mask.contains(&ip.to_canonical())),
            None => true,
        }
    }

    // ── recursive search ────────────────────────────────────────────────────

    fn make_recursive_entry(&self, target: NodeId) -> (Arc<RecurSearch>, oneshot::Receiver<String>) {
        let (search, rx) = RecurSearch::new(target);
        let search = Arc::new(search);
        let previous = self.searches.write().insert(target, search.clone());
        if previous.is_some() {
            debug!(target = %hex::encode(target), "replaced outstanding recursive search");
        }
        (search, rx)
    }

    fn complete_search(&self, target: &NodeId, address: String) {
        let Some(search) = self.searches.write().remove(target) else {
            trace!(target = %hex::encode(target), "ignoring result for unknown search");
            return;
        };
        debug!(target = %hex::encode(target), %address, "recursive search resolved");
        search.complete(address);
    }

    async fn find_peer_address(&self, target: NodeId, wait: Duration) -> DiscoveryResult<String> {
        if target == self.local {
            return Ok(self.network.listen_addr());
        }

        let (search, rx) = self.make_recursive_entry(target);
        let mut first_hop: Vec<NodeId> = self
            .dht
            .better_peers(&target, self.alpha())
            .into_iter()
            .map(|peer| peer.id)
            .collect();
        if self.network.get_peer(&target).is_some() {
            first_hop.insert(0, target);
        }
        for id in first_hop {
            if search.try_insert(id) {
                self.send(&id, find_node(target, true)).await;
            }
        }

        match timeout(wait, rx).await {
            Ok(Ok(address)) => Ok(address),
            Ok(Err(_)) => Err(DiscoveryError::SearchAbandoned(hex::encode(target))),
            Err(_) => {
                let mut searches = self.searches.write();
                if searches
                    .get(&target)
                    .is_some_and(|current| Arc::ptr_eq(current, &search))
                {
                    searches.remove(&target);
                }
                Err(DiscoveryError::SearchTimeout(hex::encode(target)))
            }
        }
    }

    /// Drop searches older than the staleness threshold. Dropping an entry
    /// closes its result channel.
    fn sweep_searches(&self) -> usize {
        let mut searches = self.searches.write();
        let before = searches.len();
        searches.retain(|_, search| search.elapsed() <= self.search_stale_after);
        let removed = before - searches.len();
        if removed > 0 {
            debug!(removed, remaining = searches.len(), "swept stale recursive searches");
        }
        removed
    }

    // ── refresh ─────────────────────────────────────────────────────────────

    async fn lookup_self(&self) {
        trace!("starting self lookup");
        for peer in self.dht.better_peers(&self.local, self.alpha()) {
            self.query(&peer, self.local).await;
        }
    }

    async fn refresh_buckets(&self) {
        for cpl in 0..self.dht.bucket_count() {
            let target = self.dht.random_id_at_cpl(cpl);
            trace!(cpl, "refreshing bucket");
            for peer in self.dht.better_peers(&target, self.alpha()) {
                self.query(&peer, target).await;
            }
        }
    }

    /// Ask one peer about `target`, bounded by the refresh query timeout.
    async fn query(&self, peer: &Contact, target: NodeId) {
        let pseudo = self
            .network
            .get_peer(&peer.id)
            .is_some_and(|info| info.pseudo);
        let msg = if pseudo {
            Message::AddrReq
        } else {
            find_node(target, false)
        };
        let limit = self.dht.config().refresh_query_timeout;
        if timeout(limit, self.send(&peer.id, msg)).await.is_err() {
            debug!(peer = %hex::encode(peer.id), "refresh query timed out");
        }
    }

    // ── io ──────────────────────────────────────────────────────────────────

    async fn send(&self, to: &NodeId, msg: Message) {
        let kind = msg.kind();
        if let Err(err) = self.network.send_to(to, msg).await {
            debug!(peer = %hex::encode(to), kind, "send failed: {err:?}");
        }
    }

    fn spawn_connect(&self, addr: String) {
        let network = self.network.clone();
        tokio::spawn(async move {
            if let Err(err) = network.connect(&addr).await {
                debug!(%addr, "connect failed: {err:?}");
            }
        });
    }
}

fn find_node(target: NodeId, recursive: bool) -> Message {
    Message::FindNodeReq(FindNodeReq { target, recursive })
}

/// Host part of `host:port` or `[v6]:port`.
fn split_host(addr: &str) -> Option<&str> {
    let (host, _port) = addr.rsplit_once(':')?;
    match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']'),
        None if host.contains(':') => None,
        None => Some(host),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background Loops
// ─────────────────────────────────────────────────────────────────────────────

async fn run_every<N, F, Fut>(
    node: Arc<Discovery<N>>,
    period: Duration,
    mut quit: watch::Receiver<bool>,
    mut tick_fn: F,
) where
    N: DiscoveryNetwork,
    F: FnMut(Arc<Discovery<N>>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => tick_fn(node.clone()).await,
            _ = quit.changed() => return,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery Node (Public API)
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a running discovery protocol instance.
///
/// Cheap to clone; all clones share the same routing state and searches.
///
/// ```ignore
/// let node = DiscoveryNode::new(network, &DiscoveryConfig::default())?;
/// node.start();
/// let addr = node.find_peer_address(target, Duration::from_secs(30)).await?;
/// ```
pub struct DiscoveryNode<N: DiscoveryNetwork> {
    inner: Arc<Discovery<N>>,
}

impl<N: DiscoveryNetwork> Clone for DiscoveryNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: DiscoveryNetwork> DiscoveryNode<N> {
    pub fn new(network: N, config: &DiscoveryConfig) -> DiscoveryResult<Self> {
        Self::with_observer(network, config, Arc::new(LogObserver))
    }

    /// Build a node whose routing table reports membership changes to
    /// `observer`.
    pub fn with_observer(
        network: N,
        config: &DiscoveryConfig,
        observer: Arc<dyn RoutingObserver>,
    ) -> DiscoveryResult<Self> {
        let mask = config.mask_set()?;
        let local = network.local_id();
        let (quit, _) = watch::channel(false);
        let inner = Discovery {
            local,
            dht: Dht::with_observer(local, config.dht_config(), observer),
            network: Arc::new(network),
            mask,
            searches: RwLock::new(HashMap::new()),
            search_sweep_interval: config.search_sweep_interval(),
            search_stale_after: config.search_stale_after(),
            quit,
            tasks: Mutex::new(Vec::new()),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local
    }

    pub fn dht(&self) -> &Dht {
        &self.inner.dht
    }

    pub fn network(&self) -> &N {
        &self.inner.network
    }

    /// Number of recursive searches currently outstanding.
    pub fn active_searches(&self) -> usize {
        self.inner.searches.read().len()
    }

    /// Spawn the self-lookup, bucket-refresh, and search-sweep loops.
    ///
    /// Each loop first fires one period after start. Calling `start` on a
    /// running or stopped node is a no-op.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() || *self.inner.quit.borrow() {
            warn!("discovery already started or stopped");
            return;
        }
        let refresh = self.inner.dht.config().refresh_period;
        tasks.push(tokio::spawn(run_every(
            self.inner.clone(),
            refresh,
            self.inner.quit.subscribe(),
            |node| async move { node.lookup_self().await },
        )));
        tasks.push(tokio::spawn(run_every(
            self.inner.clone(),
            refresh,
            self.inner.quit.subscribe(),
            |node| async move { node.refresh_buckets().await },
        )));
        tasks.push(tokio::spawn(run_every(
            self.inner.clone(),
            self.inner.search_sweep_interval,
            self.inner.quit.subscribe(),
            |node| async move {
                node.sweep_searches();
            },
        )));
        debug!(local = %hex::encode(self.inner.local), "discovery started");
    }

    /// Signal all background loops to exit.
    pub fn stop(&self) {
        self.inner.quit.send_replace(true);
        self.inner.tasks.lock().clear();
        debug!(local = %hex::encode(self.inner.local), "discovery stopped");
    }

    pub async fn on_peer_connected(&self, info: &PeerInfo) {
        self.inner.on_peer_connected(info).await;
    }

    pub fn on_peer_disconnected(&self, info: &PeerInfo) {
        self.inner.on_peer_disconnected(info);
    }

    /// Dispatch a decoded protocol message received from `from`.
    pub async fn handle_message(&self, from: &PeerInfo, msg: Message) {
        self.inner.handle_message(from, msg).await;
    }

    pub async fn handle_find_node_req(&self, from: &PeerInfo, req: FindNodeReq) {
        self.inner.handle_find_node_req(from, req).await;
    }

    pub async fn handle_find_node_resp(&self, from: &PeerInfo, resp: FindNodeResp) {
        self.inner.handle_find_node_resp(from, resp).await;
    }

    pub async fn handle_addr_req(&self, from: &PeerInfo) {
        self.inner.handle_addr_req(from).await;
    }

    pub fn handle_addr(&self, msg: Addr) {
        self.inner.handle_addr(msg);
    }

    /// Register a recursive search for `target` without sending anything.
    ///
    /// Replaces any search already outstanding for the same target; the
    /// replaced receiver then observes a closed channel.
    pub fn make_recursive_entry(&self, target: NodeId) -> oneshot::Receiver<String> {
        self.inner.make_recursive_entry(target).1
    }

    /// Resolve the listen address of `target` through a recursive search.
    pub async fn find_peer_address(&self, target: NodeId, wait: Duration) -> DiscoveryResult<String> {
        self.inner.find_peer_address(target, wait).await
    }

    /// Run one self-lookup round immediately.
    pub async fn lookup_self(&self) {
        self.inner.lookup_self().await;
    }

    /// Run one bucket-refresh round immediately.
    pub async fn refresh_buckets(&self) {
        self.inner.refresh_buckets().await;
    }

    /// Run one stale-search sweep immediately. Returns the number removed.
    pub fn sweep_searches(&self) -> usize {
        self.inner.sweep_searches()
    }
}
