//! # sDHT Discovery
//!
//! Kademlia-style peer discovery for a peer-to-peer node. A node that starts
//! with a handful of seed contacts keeps a k-bucket routing table fresh through
//! periodic lookups, answers "find closer peers" queries, and can locate peers
//! it has no direct route to through a recursive multi-hop search.
//!
//! The crate is split into modules that build on each other:
//!
//! - [`core`]: identifiers and the XOR keyspace (distance, ordering, CPL).
//! - [`bucket`]: a single capacity-bounded, recency-ordered k-bucket.
//! - [`routing`]: the [`RoutingTable`] with bucket splitting, nearest-peer
//!   queries, and membership observers.
//! - [`dht`]: the [`Dht`] facade the protocol layer talks to.
//! - [`discovery`]: the [`DiscoveryNode`] state machine: refresh loops,
//!   message handlers, recursive search, and masking.
//! - [`protocol`]: wire messages and their binary codec.
//! - [`framing`]: length-prefixed frames over any tokio stream.
//! - [`net`] and [`server`]: a TCP transport implementing [`DiscoveryNetwork`].
//! - [`config`]: TOML-loadable [`DiscoveryConfig`].
//!
//! ## Getting started
//!
//! ```no_run
//! use anyhow::Result;
//! use sdht_discovery::{derive_node_id, server, DiscoveryConfig, DiscoveryNode, TcpNetwork};
//! use tokio::net::TcpListener;
//!
//! # async fn launch() -> Result<()> {
//! let config = DiscoveryConfig::default();
//! let listener = TcpListener::bind(&config.listen).await?;
//! let local = derive_node_id(b"node public key");
//! let (network, events) = TcpNetwork::new(local, listener.local_addr()?);
//!
//! let node = DiscoveryNode::new(network.clone(), &config)?;
//! tokio::spawn(server::serve(listener, network));
//! tokio::spawn(server::run_events(node.clone(), events));
//! node.start();
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod config;
pub mod core;
pub mod dht;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod net;
pub mod protocol;
pub mod routing;
pub mod server;

pub use crate::core::{
    closer, common_prefix_len, derive_node_id, distance_cmp, xor_distance, Contact, NodeId,
    ID_BITS,
};
pub use bucket::{Bucket, BucketTouchOutcome};
pub use config::DiscoveryConfig;
pub use dht::{Dht, DhtConfig};
pub use discovery::{DiscoveryNetwork, DiscoveryNode, PeerInfo, RecurSearch};
pub use error::{DiscoveryError, DiscoveryResult, ProtocolError, RoutingError};
pub use net::{NetworkEvent, TcpNetwork};
pub use protocol::{Addr, FindNodeReq, FindNodeResp, Message, NodeAddr};
pub use routing::{ChannelObserver, LogObserver, RoutingEvent, RoutingObserver, RoutingTable};
