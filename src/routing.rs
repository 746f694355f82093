//! Kademlia routing table with bucket splitting.
//!
//! The table starts with a single catch-all bucket. Bucket `i` holds peers
//! whose common prefix length with the local identifier is exactly `i`, except
//! the last bucket which holds every peer with CPL at or beyond its index.
//! When the last bucket overflows it is split, so the table only grows deep in
//! the region of the keyspace around the local identifier.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::bucket::{Bucket, BucketTouchOutcome};
use crate::core::{
    common_prefix_len, distance_cmp, random_id_at_cpl, xor_distance, Contact, NodeId, ID_BITS,
};
use crate::error::RoutingError;

/// Deepest bucket index the table will split down to.
pub const MAX_BUCKET_INDEX: usize = ID_BITS - 1;

// ─────────────────────────────────────────────────────────────────────────────
// Observers
// ─────────────────────────────────────────────────────────────────────────────

/// Receives membership changes after the table has been mutated.
///
/// Hooks run synchronously on the mutating task once all table locks are
/// released. Implementations that need to call back into the table from a
/// different task should use a non-blocking hand-off such as
/// [`ChannelObserver`].
pub trait RoutingObserver: Send + Sync + 'static {
    fn peer_added(&self, _contact: &Contact) {}
    fn peer_removed(&self, _contact: &Contact) {}
}

/// Logs membership changes at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RoutingObserver for LogObserver {
    fn peer_added(&self, contact: &Contact) {
        debug!(peer = %hex::encode(contact.id), addr = %contact.addr, "peer added to routing table");
    }

    fn peer_removed(&self, contact: &Contact) {
        debug!(peer = %hex::encode(contact.id), addr = %contact.addr, "peer removed from routing table");
    }
}

/// A membership change published by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    Added(Contact),
    Removed(Contact),
}

/// Forwards membership changes onto an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<RoutingEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RoutingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RoutingObserver for ChannelObserver {
    fn peer_added(&self, contact: &Contact) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(RoutingEvent::Added(contact.clone()));
    }

    fn peer_removed(&self, contact: &Contact) {
        let _ = self.tx.send(RoutingEvent::Removed(contact.clone()));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// Kademlia routing table indexed by common prefix length to the local node.
///
/// The table-level lock guards the bucket list. Per-peer mutation holds it
/// shared and takes only the target bucket's own lock, so updates to unrelated
/// buckets do not serialize; a split takes it exclusively.
pub struct RoutingTable {
    /// This node's ID.
    local: NodeId,
    /// Maximum contacts per bucket (k parameter).
    bucket_size: usize,
    /// Buckets ordered by CPL; the last one is the catch-all.
    buckets: RwLock<Vec<Arc<Bucket>>>,
    observer: Arc<dyn RoutingObserver>,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local", &hex::encode(self.local))
            .field("bucket_size", &self.bucket_size)
            .field("buckets", &self.bucket_count())
            .finish_non_exhaustive()
    }
}

impl RoutingTable {
    /// Create a routing table that logs membership changes.
    pub fn new(local: NodeId, bucket_size: usize) -> Self {
        Self::with_observer(local, bucket_size, Arc::new(LogObserver))
    }

    /// Create a routing table with a custom membership observer.
    pub fn with_observer(
        local: NodeId,
        bucket_size: usize,
        observer: Arc<dyn RoutingObserver>,
    ) -> Self {
        Self {
            local,
            bucket_size,
            buckets: RwLock::new(vec![Arc::new(Bucket::new())]),
            observer,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Number of contacts in each bucket, by index.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.read().iter().map(|b| b.len()).collect()
    }

    /// Total number of contacts in the table.
    pub fn len(&self) -> usize {
        self.buckets.read().iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` on the bucket `id` belongs to, with the table read lock held
    /// so a concurrent split cannot move the bucket's range underneath it.
    fn with_bucket<R>(&self, id: &NodeId, f: impl FnOnce(usize, usize, &Bucket) -> R) -> R {
        let cpl = common_prefix_len(&self.local, id);
        let buckets = self.buckets.read();
        let last = buckets.len() - 1;
        let idx = cpl.min(last);
        f(idx, last, &buckets[idx])
    }

    /// Add or refresh a contact.
    ///
    /// An existing contact is moved to the front of its bucket. A new contact
    /// is inserted if its bucket has room; if the bucket is the full catch-all
    /// it is split first. Returns [`RoutingError::BucketFull`] when the contact
    /// still does not fit. Eviction is left to the caller.
    pub fn update(&self, contact: Contact) -> Result<(), RoutingError> {
        if contact.id == self.local {
            return Err(RoutingError::SelfEntry);
        }

        let (idx, last, outcome) = self.with_bucket(&contact.id, |idx, last, bucket| {
            (idx, last, bucket.touch(contact.clone(), self.bucket_size))
        });
        match outcome {
            BucketTouchOutcome::Refreshed => return Ok(()),
            BucketTouchOutcome::Inserted => {
                self.observer.peer_added(&contact);
                return Ok(());
            }
            BucketTouchOutcome::Full { oldest } => {
                if idx != last || last >= MAX_BUCKET_INDEX {
                    return Err(RoutingError::BucketFull {
                        bucket: idx,
                        least_recent: oldest,
                    });
                }
            }
        }

        self.split_last(idx);

        // The peer may belong to the newly appended bucket now.
        let (idx, outcome) = self.with_bucket(&contact.id, |idx, _, bucket| {
            (idx, bucket.touch(contact.clone(), self.bucket_size))
        });
        match outcome {
            BucketTouchOutcome::Refreshed => Ok(()),
            BucketTouchOutcome::Inserted => {
                self.observer.peer_added(&contact);
                Ok(())
            }
            BucketTouchOutcome::Full { oldest } => Err(RoutingError::BucketFull {
                bucket: idx,
                least_recent: oldest,
            }),
        }
    }

    /// Split the catch-all bucket, cascading while the new last bucket is full.
    ///
    /// `expected_last` is the index the caller observed as last; if another
    /// task already split in the meantime this is a no-op.
    fn split_last(&self, expected_last: usize) {
        let mut buckets = self.buckets.write();
        if buckets.len() - 1 != expected_last {
            return;
        }

        loop {
            let last = buckets.len() - 1;
            if last >= MAX_BUCKET_INDEX || buckets[last].len() < self.bucket_size {
                break;
            }
            let closer = buckets[last].split(last, &self.local);
            trace!(
                bucket = last,
                kept = buckets[last].len(),
                moved = closer.len(),
                "split routing bucket"
            );
            buckets.push(Arc::new(closer));
        }
    }

    /// Remove a contact if present, returning it.
    pub fn remove(&self, id: &NodeId) -> Option<Contact> {
        let removed = self.with_bucket(id, |_, _, bucket| bucket.remove(id))?;
        self.observer.peer_removed(&removed);
        Some(removed)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.with_bucket(id, |_, _, bucket| bucket.has(id))
    }

    /// Find up to `count` contacts closest to `target`, nearest first.
    ///
    /// Candidates are gathered starting at the bucket matching the target's
    /// CPL, then the buckets deeper than it, then the shallower buckets from
    /// nearest to furthest, stopping once `count` candidates are collected.
    /// Ties keep their gathering order.
    pub fn nearest_peers(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        let buckets: Vec<Arc<Bucket>> = self.buckets.read().clone();
        let last = buckets.len() - 1;
        let cpl = common_prefix_len(&self.local, target).min(last);

        let order = std::iter::once(cpl)
            .chain(cpl + 1..=last)
            .chain((0..cpl).rev());

        let mut candidates: Vec<Contact> = Vec::new();
        for idx in order {
            if candidates.len() >= count {
                break;
            }
            candidates.extend(buckets[idx].peers());
        }

        candidates.sort_by(|a, b| {
            let da = xor_distance(&a.id, target);
            let db = xor_distance(&b.id, target);
            distance_cmp(&da, &db)
        });
        candidates.truncate(count);
        candidates
    }

    /// All contacts in the table, bucket by bucket, most recent first within each.
    pub fn list_peers(&self) -> Vec<Contact> {
        let buckets: Vec<Arc<Bucket>> = self.buckets.read().clone();
        buckets.iter().flat_map(|b| b.peers()).collect()
    }

    /// A random identifier sharing exactly `cpl` leading bits with the local id.
    pub fn random_id_at_cpl(&self, cpl: usize) -> NodeId {
        random_id_at_cpl(&self.local, cpl)
    }
}
