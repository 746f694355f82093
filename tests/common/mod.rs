#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant};

use sdht_discovery::{
    derive_node_id, DiscoveryConfig, DiscoveryNetwork, DiscoveryNode, Message, NodeId, PeerInfo,
};

/// In-memory transport. Delivery is by direct handler invocation on the
/// registered target node.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    local: NodeId,
    addr: SocketAddr,
    connected: Arc<RwLock<HashMap<NodeId, PeerInfo>>>,
    inbox: Arc<Mutex<Vec<(NodeId, Message)>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, local: NodeId, addr: SocketAddr) -> Self {
        Self {
            registry,
            local,
            addr,
            connected: Arc::new(RwLock::new(HashMap::new())),
            inbox: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo::new(self.local, self.addr, self.addr.to_string())
    }

    pub fn connection_count(&self) -> usize {
        self.connected.read().len()
    }

    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.connected.read().contains_key(id)
    }

    /// Every message delivered to this node so far, with its sender.
    pub fn received(&self) -> Vec<(NodeId, Message)> {
        self.inbox.lock().clone()
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    nodes: RwLock<HashMap<NodeId, DiscoveryNode<TestNetwork>>>,
    addrs: RwLock<HashMap<String, NodeId>>,
    allowed: RwLock<HashSet<(NodeId, NodeId)>>,
    links: Mutex<HashSet<(NodeId, NodeId)>>,
}

fn pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl NetworkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &DiscoveryNode<TestNetwork>) {
        let network = node.network();
        self.addrs
            .write()
            .insert(network.addr.to_string(), network.local);
        self.nodes.write().insert(network.local, node.clone());
    }

    pub fn get(&self, id: &NodeId) -> Option<DiscoveryNode<TestNetwork>> {
        self.nodes.read().get(id).cloned()
    }

    pub fn allow_connect(&self, a: NodeId, b: NodeId) {
        self.allowed.write().insert(pair(a, b));
    }

    pub fn is_allowed(&self, a: NodeId, b: NodeId) -> bool {
        self.allowed.read().contains(&pair(a, b))
    }

    /// Link two registered nodes and notify both discovery instances.
    pub async fn link(&self, a: NodeId, b: NodeId) -> Result<()> {
        if !self.is_allowed(a, b) {
            return Err(anyhow!("connection not allowed"));
        }
        let (node_a, node_b) = match (self.get(&a), self.get(&b)) {
            (Some(node_a), Some(node_b)) => (node_a, node_b),
            _ => return Err(anyhow!("peer not registered")),
        };
        if !self.links.lock().insert(pair(a, b)) {
            return Ok(());
        }

        let info_a = node_a.network().info();
        let info_b = node_b.network().info();
        node_a.network().connected.write().insert(b, info_b.clone());
        node_b.network().connected.write().insert(a, info_a.clone());

        node_a.on_peer_connected(&info_b).await;
        node_b.on_peer_connected(&info_a).await;
        Ok(())
    }

    pub fn unlink(&self, a: NodeId, b: NodeId) {
        if !self.links.lock().remove(&pair(a, b)) {
            return;
        }
        if let (Some(node_a), Some(node_b)) = (self.get(&a), self.get(&b)) {
            let info_a = node_a.network().connected.write().remove(&b);
            let info_b = node_b.network().connected.write().remove(&a);
            if let Some(info) = info_a {
                node_a.on_peer_disconnected(&info);
            }
            if let Some(info) = info_b {
                node_b.on_peer_disconnected(&info);
            }
        }
    }
}

#[async_trait::async_trait]
impl DiscoveryNetwork for TestNetwork {
    fn local_id(&self) -> NodeId {
        self.local
    }

    fn listen_addr(&self) -> String {
        self.addr.to_string()
    }

    fn get_peer(&self, id: &NodeId) -> Option<PeerInfo> {
        self.connected.read().get(id).cloned()
    }

    async fn send_to(&self, to: &NodeId, msg: Message) -> Result<()> {
        if !self.is_connected(to) {
            return Err(anyhow!("peer not connected"));
        }
        let peer = self
            .registry
            .get(to)
            .ok_or_else(|| anyhow!("peer not registered"))?;
        peer.network().inbox.lock().push((self.local, msg.clone()));
        let from = self.info();
        tokio::spawn(async move { peer.handle_message(&from, msg).await });
        Ok(())
    }

    async fn connect(&self, addr: &str) -> Result<()> {
        let target = self
            .registry
            .addrs
            .read()
            .get(addr)
            .copied()
            .ok_or_else(|| anyhow!("no node listens on {addr}"))?;
        if target == self.local {
            return Err(anyhow!("refusing to dial self"));
        }
        self.registry.link(self.local, target).await
    }
}

pub struct TestNode {
    pub node: DiscoveryNode<TestNetwork>,
    pub network: TestNetwork,
}

impl TestNode {
    pub fn new(registry: &Arc<NetworkRegistry>, index: u8, config: &DiscoveryConfig) -> Self {
        let network = TestNetwork::new(registry.clone(), make_node_id(index), make_addr(index));
        let node = DiscoveryNode::new(network.clone(), config).expect("valid config");
        registry.register(&node);
        Self { node, network }
    }

    pub fn id(&self) -> NodeId {
        self.node.local_id()
    }

    pub fn addr(&self) -> String {
        self.network.listen_addr()
    }
}

pub fn make_node_id(index: u8) -> NodeId {
    derive_node_id(format!("test-node-{index}").as_bytes())
}

pub fn make_addr(index: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, index], 20338))
}

/// Fast loops so convergence happens within a test's lifetime.
pub fn fast_config() -> DiscoveryConfig {
    DiscoveryConfig {
        refresh_period_ms: 20,
        refresh_query_timeout_ms: 500,
        ..DiscoveryConfig::default()
    }
}

pub fn allow_all(registry: &NetworkRegistry, nodes: &[&TestNode]) {
    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            registry.allow_connect(a.id(), b.id());
        }
    }
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check()
}
