//! Volatile best-known-address map.
//!
//! Every discovery source writes here before the durable store, so the
//! cache may be ahead of the store. Entries live until process restart.

use std::sync::Arc;

use dashmap::DashMap;
use trellis_core::peer::{merge_addresses, PeerId, PeerRecord};

#[derive(Clone, Default)]
pub struct AddressCache {
    addresses: Arc<DashMap<PeerId, Vec<String>>>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self {
            addresses: Arc::new(DashMap::new()),
        }
    }

    /// Overwrite a peer's addresses.
    pub fn set(&self, peer: PeerId, addresses: Vec<String>) {
        self.addresses.insert(peer, addresses);
    }

    pub fn get(&self, peer: &PeerId) -> Option<Vec<String>> {
        self.addresses.get(peer).map(|a| a.clone())
    }

    /// Merge `fresh` in front of the cached addresses and return the result.
    ///
    /// Runs under the entry lock, so concurrent merges for the same peer
    /// never lose each other's addresses.
    pub fn merge(&self, peer: PeerId, fresh: &[String]) -> Vec<String> {
        let mut entry = self.addresses.entry(peer).or_default();
        let merged = merge_addresses(fresh, entry.value());
        *entry.value_mut() = merged.clone();
        merged
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.addresses.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Load persisted records, keeping anything already cached in front.
    pub fn seed(&self, records: &[PeerRecord]) {
        for record in records {
            let mut entry = self.addresses.entry(record.peer_id.clone()).or_default();
            let merged = merge_addresses(entry.value(), &record.addresses);
            *entry.value_mut() = merged;
        }
    }
}
