#[path = "common/mod.rs"]
mod common;

use common::{allow_all, eventually, fast_config, NetworkRegistry, TestNode};
use sdht_discovery::{DiscoveryConfig, DiscoveryNetwork, Message};
use tokio::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nodes_bootstrapped_from_one_seed_learn_the_whole_network() {
    let registry = NetworkRegistry::new();
    let config = fast_config();
    let seed = TestNode::new(&registry, 1, &config);
    let nodes: Vec<TestNode> = (2..=6).map(|i| TestNode::new(&registry, i, &config)).collect();

    // Only seed links are allowed at first.
    for node in &nodes {
        registry.allow_connect(seed.id(), node.id());
    }
    for node in nodes.iter().chain(std::iter::once(&seed)) {
        node.node.start();
    }
    for node in &nodes {
        node.network.connect(&seed.addr()).await.expect("seed reachable");
    }

    assert!(
        eventually(Duration::from_secs(5), || seed.network.connection_count() == nodes.len()).await,
        "seed should see every node"
    );
    for node in &nodes {
        assert_eq!(node.network.connection_count(), 1);
    }

    let mut everyone: Vec<&TestNode> = nodes.iter().collect();
    everyone.push(&seed);
    allow_all(&registry, &everyone);

    let converged = eventually(Duration::from_secs(10), || {
        everyone.iter().all(|a| {
            everyone
                .iter()
                .filter(|b| b.id() != a.id())
                .all(|b| a.node.dht().contains(&b.id()))
        })
    })
    .await;
    for node in &everyone {
        node.node.stop();
    }
    assert!(converged, "every routing table should contain every other node");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recursive_search_reaches_a_node_two_hops_away() {
    // a --- b --- c
    //        \
    //         d --- e
    let registry = NetworkRegistry::new();
    let config = fast_config();
    let a = TestNode::new(&registry, 1, &config);
    let b = TestNode::new(&registry, 2, &config);
    let c = TestNode::new(&registry, 3, &config);
    let d = TestNode::new(&registry, 4, &config);
    let e = TestNode::new(&registry, 5, &config);
    allow_all(&registry, &[&a, &b, &c, &d, &e]);

    for seeded in [&a, &c, &d] {
        seeded.network.connect(&b.addr()).await.expect("b reachable");
    }
    e.network.connect(&d.addr()).await.expect("d reachable");
    assert!(!a.network.is_connected(&e.id()));
    assert!(!a.node.dht().contains(&e.id()));

    for node in [&a, &b, &c, &d, &e] {
        node.node.start();
    }

    let found = a
        .node
        .find_peer_address(e.id(), Duration::from_secs(5))
        .await
        .expect("e is found");
    assert_eq!(found, e.addr());
    assert_eq!(a.node.active_searches(), 0);

    for node in [&a, &b, &c, &d, &e] {
        node.node.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recursive_search_for_connected_peer_resolves_directly() {
    let registry = NetworkRegistry::new();
    let config = DiscoveryConfig::default();
    let a = TestNode::new(&registry, 1, &config);
    let b = TestNode::new(&registry, 2, &config);
    registry.allow_connect(a.id(), b.id());
    a.network.connect(&b.addr()).await.expect("b reachable");

    let found = a
        .node
        .find_peer_address(b.id(), Duration::from_secs(2))
        .await
        .expect("b answers for itself");
    assert_eq!(found, b.addr());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn masked_peers_stay_hidden_from_outsiders() {
    //      seed
    //     /    \
    //  normal  reserved
    let registry = NetworkRegistry::new();
    let reserved_ip = common::make_addr(3).ip().to_string();
    let seed = TestNode::new(
        &registry,
        1,
        &DiscoveryConfig {
            mask: vec![reserved_ip],
            ..fast_config()
        },
    );
    let normal = TestNode::new(&registry, 2, &fast_config());
    let reserved = TestNode::new(&registry, 3, &fast_config());
    registry.allow_connect(seed.id(), normal.id());
    registry.allow_connect(seed.id(), reserved.id());

    for node in [&seed, &normal, &reserved] {
        node.node.start();
    }
    normal.network.connect(&seed.addr()).await.expect("seed reachable");
    reserved.network.connect(&seed.addr()).await.expect("seed reachable");

    // Reserved is a mask member, so it learns about normal through the seed.
    let reserved_learned = eventually(Duration::from_secs(5), || {
        reserved.network.received().iter().any(|(from, msg)| {
            *from == seed.id()
                && matches!(msg, Message::FindNodeResp(resp)
                    if resp.closer_peers.iter().any(|p| p.id == normal.id()))
        })
    })
    .await;
    assert!(reserved_learned, "mask members see everyone");

    let normal_answered = eventually(Duration::from_secs(5), || {
        normal
            .network
            .received()
            .iter()
            .any(|(_, msg)| matches!(msg, Message::FindNodeResp(_)))
    })
    .await;
    assert!(normal_answered, "normal should have been answered");

    let leaked = normal.network.received().iter().any(|(_, msg)| match msg {
        Message::FindNodeResp(resp) => resp.closer_peers.iter().any(|p| p.id == reserved.id()),
        Message::Addr(addr) => addr.node_addrs.iter().any(|n| n.id == reserved.id()),
        _ => false,
    });
    assert!(!leaked, "normal must never be told about the reserved node");
    assert!(!normal.node.dht().contains(&reserved.id()));

    for node in [&seed, &normal, &reserved] {
        node.node.stop();
    }
}
