//! Thin stateful facade over one [`RoutingTable`].
//!
//! The discovery protocol talks to the routing state only through [`Dht`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::core::{Contact, NodeId};
use crate::error::RoutingError;
use crate::routing::{LogObserver, RoutingObserver, RoutingTable};

/// Default bucket size (k parameter).
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Default lookup fan-out (alpha parameter).
pub const DEFAULT_ALPHA: usize = 3;

/// Default period of the self-lookup and bucket-refresh loops.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(10);

/// Default bound on a single refresh query send.
pub const DEFAULT_REFRESH_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Routing and refresh parameters for a [`Dht`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtConfig {
    pub bucket_size: usize,
    pub alpha: usize,
    pub refresh_period: Duration,
    pub refresh_query_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
            refresh_period: DEFAULT_REFRESH_PERIOD,
            refresh_query_timeout: DEFAULT_REFRESH_QUERY_TIMEOUT,
        }
    }
}

/// Local routing state: the node's identifier plus its routing table.
#[derive(Debug)]
pub struct Dht {
    local: NodeId,
    table: RoutingTable,
    config: DhtConfig,
}

impl Dht {
    pub fn new(local: NodeId, config: DhtConfig) -> Self {
        Self::with_observer(local, config, Arc::new(LogObserver))
    }

    pub fn with_observer(
        local: NodeId,
        config: DhtConfig,
        observer: Arc<dyn RoutingObserver>,
    ) -> Self {
        Self {
            local,
            table: RoutingTable::with_observer(local, config.bucket_size, observer),
            config,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    /// Record that `contact` is alive. Returns false if it could not be stored.
    pub fn update(&self, contact: Contact) -> bool {
        match self.table.update(contact) {
            Ok(()) => true,
            Err(err) => {
                trace!(%err, "routing table update rejected");
                false
            }
        }
    }

    /// Like [`Dht::update`], but evicts the least-recently-seen occupant of a
    /// full bucket when `is_alive` reports it gone.
    ///
    /// A live occupant always wins over the newcomer.
    pub fn update_or_evict<F>(&self, contact: Contact, is_alive: F) -> bool
    where
        F: Fn(&NodeId) -> bool,
    {
        match self.table.update(contact.clone()) {
            Ok(()) => true,
            Err(RoutingError::BucketFull {
                bucket,
                least_recent,
            }) => {
                if is_alive(&least_recent.id) {
                    trace!(bucket, "bucket full and least recent peer alive; dropping newcomer");
                    return false;
                }
                debug!(
                    bucket,
                    evicted = %hex::encode(least_recent.id),
                    "evicting stale peer from full bucket"
                );
                self.table.remove(&least_recent.id);
                self.table.update(contact).is_ok()
            }
            Err(RoutingError::SelfEntry) => false,
        }
    }

    pub fn remove(&self, id: &NodeId) {
        self.table.remove(id);
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.table.contains(id)
    }

    /// Nearest known peers to `target`, excluding ourselves and the target.
    pub fn better_peers(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.table
            .nearest_peers(target, count)
            .into_iter()
            .filter(|c| c.id != self.local && &c.id != target)
            .collect()
    }

    pub fn list_peers(&self) -> Vec<Contact> {
        self.table.list_peers()
    }

    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    pub fn random_id_at_cpl(&self, cpl: usize) -> NodeId {
        self.table.random_id_at_cpl(cpl)
    }
}
