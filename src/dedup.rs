//! Bounded cache of recently completed message identities

use std::collections::{HashSet, VecDeque};

/// Default capacity used by clients
pub const DEFAULT_CAPACITY: usize = 11000;

/// Fixed-capacity ordered set, oldest entries evicted first
///
/// Looking an identity up refreshes it, so an identity that keeps being
/// announced stays cached.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        DedupCache {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.members.contains(identity)
    }

    /// Returns true when the identity is cached, moving it to the newest slot
    pub fn touch(&mut self, identity: &str) -> bool {
        if !self.members.contains(identity) {
            return false;
        }
        if let Some(pos) = self.order.iter().position(|i| i == identity) {
            if let Some(entry) = self.order.remove(pos) {
                self.order.push_back(entry);
            }
        }
        true
    }

    /// Adds an identity; returns false if it was already present
    pub fn insert(&mut self, identity: impl Into<String>) -> bool {
        let identity = identity.into();
        if self.touch(&identity) {
            return false;
        }
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.members.remove(&old);
                }
                None => break,
            }
        }
        self.members.insert(identity.clone());
        self.order.push_back(identity);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        DedupCache::new(DEFAULT_CAPACITY)
    }
}
