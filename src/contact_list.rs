//! Contacts ordered by XOR distance to a fixed reference id.
//!
//! Serves both as a node's routing state and as the working set of a single
//! iterative lookup. Entries track whether they were already queried
//! (`contacted`) so a lookup never asks the same peer twice.

use std::cmp::Ordering;

use crate::identity::{distance_cmp, distance_delta, NodeId, PeerIdentity};

#[derive(Clone, Debug)]
pub struct ContactEntry {
    pub identity: PeerIdentity,
    pub contacted: bool,
}

#[derive(Clone, Debug)]
pub struct ContactList {
    reference: NodeId,
    capacity: usize,
    allow_reference: bool,
    /// Ascending by distance to `reference`, ties by raw id bytes.
    entries: Vec<ContactEntry>,
}

impl ContactList {
    pub fn new(reference: NodeId, capacity: usize) -> Self {
        Self {
            reference,
            capacity,
            allow_reference: false,
            entries: Vec::with_capacity(capacity.min(64)),
        }
    }

    /// Working list of a lookup for `target`. Unlike a routing list it may
    /// hold the peer whose id equals the reference, since that peer is the
    /// best possible answer.
    pub fn for_lookup(target: NodeId, capacity: usize) -> Self {
        Self {
            allow_reference: true,
            ..Self::new(target, capacity)
        }
    }

    pub fn reference_id(&self) -> NodeId {
        self.reference
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn order(&self, a: &NodeId, b: &NodeId) -> Ordering {
        let da = self.reference.xor_distance(a);
        let db = self.reference.xor_distance(b);
        distance_cmp(&da, &db).then_with(|| a.as_bytes().cmp(b.as_bytes()))
    }

    fn position(&self, id: &NodeId) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| self.order(&entry.identity.node_id, id))
    }

    /// Insert `identity`, or refresh the connectivity of a known entry.
    ///
    /// Returns `true` when the contact is present in the list afterwards.
    /// The reference id itself is never stored (except in lookup lists), and
    /// at capacity the farthest entry is evicted (which may be the new contact).
    pub fn add_contact(&mut self, identity: PeerIdentity) -> bool {
        if (identity.node_id == self.reference && !self.allow_reference) || self.capacity == 0 {
            return false;
        }
        match self.position(&identity.node_id) {
            Ok(idx) => {
                self.entries[idx].identity = identity;
                true
            }
            Err(idx) => {
                if self.entries.len() >= self.capacity && idx >= self.entries.len() {
                    return false;
                }
                self.entries.insert(
                    idx,
                    ContactEntry {
                        identity,
                        contacted: false,
                    },
                );
                if self.entries.len() > self.capacity {
                    self.entries.pop();
                }
                true
            }
        }
    }

    pub fn add_contacts(&mut self, identities: impl IntoIterator<Item = PeerIdentity>) {
        for identity in identities {
            self.add_contact(identity);
        }
    }

    /// Up to `limit` closest entries not yet contacted, ascending by distance.
    pub fn get_uncontacted_contacts(&self, limit: usize) -> Vec<PeerIdentity> {
        self.entries
            .iter()
            .filter(|entry| !entry.contacted)
            .take(limit)
            .map(|entry| entry.identity.clone())
            .collect()
    }

    /// Mark an entry as contacted. Unknown ids are ignored.
    pub fn set_contacted(&mut self, id: &NodeId) {
        if let Ok(idx) = self.position(id) {
            self.entries[idx].contacted = true;
        }
    }

    pub fn get_contact(&self, id: &NodeId) -> Option<&ContactEntry> {
        self.position(id).ok().map(|idx| &self.entries[idx])
    }

    pub fn get_closest_contacts(&self, limit: usize) -> Vec<PeerIdentity> {
        self.entries
            .iter()
            .take(limit)
            .map(|entry| entry.identity.clone())
            .collect()
    }

    pub fn get_all_contacts(&self) -> Vec<PeerIdentity> {
        self.get_closest_contacts(self.entries.len())
    }

    pub fn entries(&self) -> &[ContactEntry] {
        &self.entries
    }

    pub fn remove_contact(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Ok(idx) => {
                self.entries.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.position(id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Signed difference of the distances of `a` and `b` to the reference.
    /// Negative when `a` is closer.
    pub fn compare_ids(&self, a: &NodeId, b: &NodeId) -> i64 {
        let da = self.reference.xor_distance(a);
        let db = self.reference.xor_distance(b);
        distance_delta(&da, &db)
    }

    /// Distance of the closest entry, if any.
    pub fn closest_distance(&self) -> Option<crate::identity::Distance> {
        self.entries
            .first()
            .map(|entry| self.reference.xor_distance(&entry.identity.node_id))
    }
}
