//! A single k-bucket: a capacity-bounded, recency-ordered list of contacts.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::core::{common_prefix_len, Contact, NodeId};

/// Outcome of attempting to add or refresh a contact in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketTouchOutcome {
    /// Contact was newly inserted at the front (bucket had space).
    Inserted,
    /// Existing contact was moved to the front.
    Refreshed,
    /// Bucket is full; includes the least-recently-seen contact.
    Full { oldest: Contact },
}

/// A Kademlia routing bucket.
///
/// Contacts are kept most-recently-seen first. Every operation takes the
/// bucket's own lock, so a shared `Bucket` is safe under concurrent readers
/// and writers.
#[derive(Debug, Default)]
pub struct Bucket {
    contacts: Mutex<VecDeque<Contact>>,
}

impl Bucket {
    /// Create a new empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    fn from_contacts(contacts: VecDeque<Contact>) -> Self {
        Self {
            contacts: Mutex::new(contacts),
        }
    }

    /// Snapshot of the bucket, front (most recent) to back.
    pub fn peers(&self) -> Vec<Contact> {
        self.contacts.lock().iter().cloned().collect()
    }

    pub fn has(&self, id: &NodeId) -> bool {
        self.contacts.lock().iter().any(|c| &c.id == id)
    }

    pub fn len(&self) -> usize {
        self.contacts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.lock().is_empty()
    }

    /// Move a contact to the front if present. Insertion is separate.
    ///
    /// Returns true if the contact was found.
    pub fn update(&self, id: &NodeId) -> bool {
        let mut contacts = self.contacts.lock();
        match contacts.iter().position(|c| &c.id == id) {
            Some(pos) => {
                if let Some(existing) = contacts.remove(pos) {
                    contacts.push_front(existing);
                }
                true
            }
            None => false,
        }
    }

    /// Unconditionally insert at the front.
    ///
    /// The caller is responsible for uniqueness and capacity; prefer
    /// [`Bucket::touch`] when both checks are needed atomically.
    pub fn push_front(&self, contact: Contact) {
        self.contacts.lock().push_front(contact);
    }

    /// Remove and return the least-recently-seen contact.
    pub fn pop_back(&self) -> Option<Contact> {
        self.contacts.lock().pop_back()
    }

    /// The least-recently-seen contact, without removing it.
    pub fn peek_back(&self) -> Option<Contact> {
        self.contacts.lock().back().cloned()
    }

    /// Remove a contact, returning it if it was present.
    pub fn remove(&self, id: &NodeId) -> Option<Contact> {
        let mut contacts = self.contacts.lock();
        let pos = contacts.iter().position(|c| &c.id == id)?;
        contacts.remove(pos)
    }

    /// Attempt to add or refresh a contact under a single lock acquisition.
    ///
    /// - If the contact exists, moves it to the front
    /// - If the bucket has space, inserts the contact at the front
    /// - If the bucket is full, returns the oldest contact for potential eviction
    pub fn touch(&self, contact: Contact, capacity: usize) -> BucketTouchOutcome {
        let mut contacts = self.contacts.lock();
        if let Some(pos) = contacts.iter().position(|c| c.id == contact.id) {
            if let Some(mut existing) = contacts.remove(pos) {
                existing.addr = contact.addr;
                contacts.push_front(existing);
            }
            return BucketTouchOutcome::Refreshed;
        }

        if contacts.len() < capacity {
            contacts.push_front(contact);
            return BucketTouchOutcome::Inserted;
        }

        match contacts.back() {
            Some(oldest) => BucketTouchOutcome::Full {
                oldest: oldest.clone(),
            },
            // Zero capacity: nothing to evict, and nothing fits.
            None => BucketTouchOutcome::Full { oldest: contact },
        }
    }

    /// Move every contact whose CPL to `target` exceeds `cpl` into a new bucket.
    ///
    /// The receiver keeps the rest. Relative recency order is preserved on
    /// both sides.
    pub fn split(&self, cpl: usize, target: &NodeId) -> Bucket {
        let mut contacts = self.contacts.lock();
        let (moved, kept): (VecDeque<Contact>, VecDeque<Contact>) = contacts
            .drain(..)
            .partition(|c| common_prefix_len(&c.id, target) > cpl);
        *contacts = kept;
        Bucket::from_contacts(moved)
    }
}
