//! Transaction registrations.
//!
//! The peer assigns every transaction a nonzero id, quoted in the header of
//! each request made under it. Records are keyed locally rather than by
//! peer id: after a suspend/resume cycle the replacement peer may hand out
//! ids the invalidated records still carry.

use std::{collections::HashMap, panic::Location};

/// One open transaction.
pub(crate) struct TransactionEntry {
    peer_id: u32,
    active: bool,
    origin: &'static Location<'static>,
}

impl TransactionEntry {
    pub(crate) fn peer_id(&self) -> u32 { self.peer_id }

    pub(crate) fn is_active(&self) -> bool { self.active }
}

/// Diagnostic view of one open transaction.
#[derive(Clone, Copy, Debug)]
pub struct TransactionSnapshot {
    /// Peer-assigned id quoted in request headers.
    pub peer_id: u32,
    /// Whether the peer that assigned the id is still the one connected.
    pub active: bool,
    /// Call site the transaction was started from.
    pub origin: &'static Location<'static>,
}

impl std::fmt::Display for TransactionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "transaction {} ({}) from {}",
            self.peer_id,
            if self.active { "active" } else { "inactive" },
            self.origin
        )
    }
}

/// Table of open transactions. All access happens under the channel lock.
pub(crate) struct TransactionRegistry {
    next_key: u64,
    entries: HashMap<u64, TransactionEntry>,
}

impl TransactionRegistry {
    pub(crate) fn new() -> Self {
        Self { next_key: 1, entries: HashMap::new() }
    }

    /// Record an opened transaction and return its local key.
    pub(crate) fn register(&mut self, peer_id: u32, origin: &'static Location<'static>) -> u64 {
        debug_assert_ne!(peer_id, 0);
        let key = self.next_key;
        self.next_key += 1;
        self.entries.insert(key, TransactionEntry { peer_id, active: true, origin });
        key
    }

    pub(crate) fn entry(&self, key: u64) -> Option<&TransactionEntry> { self.entries.get(&key) }

    /// Drop a record, returning it when it was live.
    pub(crate) fn remove(&mut self, key: u64) -> Option<TransactionEntry> {
        self.entries.remove(&key)
    }

    /// Mark every transaction inactive: the peer that assigned their ids is
    /// gone, so they can never commit.
    pub(crate) fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.active = false;
        }
    }

    /// Number of open transactions.
    pub(crate) fn outstanding(&self) -> usize { self.entries.len() }

    /// Snapshot for diagnostics and teardown audits, in key order.
    pub(crate) fn snapshot(&self) -> Vec<TransactionSnapshot> {
        let mut keys: Vec<&u64> = self.entries.keys().collect();
        keys.sort_unstable();
        keys.into_iter()
            .map(|key| {
                let entry = &self.entries[key];
                TransactionSnapshot {
                    peer_id: entry.peer_id,
                    active: entry.active,
                    origin: entry.origin,
                }
            })
            .collect()
    }
}

/// Handle naming one open transaction.
///
/// Ending a transaction consumes the handle, so a record can never be
/// finalised twice.
#[derive(Debug, PartialEq, Eq)]
pub struct Transaction {
    pub(crate) key: u64,
}

/// How a transaction ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndStatus {
    /// The commit or abort took effect.
    Completed,
    /// The transaction lost: its snapshot conflicted with a concurrent
    /// change, or a suspend cycle replaced the peer that held it. Start a
    /// fresh transaction and replay the work.
    Retry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_local_and_stable_across_peer_id_reuse() {
        let mut registry = TransactionRegistry::new();
        let first = registry.register(1, Location::caller());
        registry.invalidate_all();
        // A replacement peer may assign id 1 again; both records coexist.
        let second = registry.register(1, Location::caller());
        assert_ne!(first, second);
        assert!(!registry.entry(first).expect("record kept").is_active());
        assert!(registry.entry(second).expect("record kept").is_active());
    }

    #[test]
    fn remove_is_final() {
        let mut registry = TransactionRegistry::new();
        let key = registry.register(7, Location::caller());
        assert_eq!(registry.remove(key).map(|entry| entry.peer_id()), Some(7));
        assert!(registry.remove(key).is_none());
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn snapshot_orders_by_creation() {
        let mut registry = TransactionRegistry::new();
        registry.register(5, Location::caller());
        registry.register(9, Location::caller());
        let ids: Vec<u32> = registry.snapshot().iter().map(|s| s.peer_id).collect();
        assert_eq!(ids, [5, 9]);
    }
}
