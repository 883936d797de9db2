//! Connection tracker: the set of peers we are connected to right now.
//!
//! Mutated only from substrate connect/disconnect events. Also owns the
//! address resolution performed when a peer connects.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use trellis_core::peer::PeerId;
use trellis_core::substrate::Substrate;

use crate::cache::AddressCache;

#[derive(Clone, Default)]
pub struct ConnectionTracker {
    connected: Arc<DashSet<PeerId>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            connected: Arc::new(DashSet::new()),
        }
    }

    /// Returns false if the peer was already tracked.
    pub fn connected(&self, peer: PeerId) -> bool {
        self.connected.insert(peer)
    }

    /// Returns false if the peer was not tracked.
    pub fn disconnected(&self, peer: &PeerId) -> bool {
        self.connected.remove(peer).is_some()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.connected.contains(peer)
    }

    pub fn snapshot(&self) -> Vec<PeerId> {
        self.connected.iter().map(|p| p.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }
}

// ── Address resolution ────────────────────────────────────────────────────────

/// Fixed backoff schedule for polling the substrate address book.
///
/// The address book is filled asynchronously after the handshake, so it is
/// often empty at the instant the connect event fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Total attempts, including the immediate one.
    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(5),
        ])
    }
}

/// Where a connected peer's addresses were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSource {
    Cache,
    RemoteAddress,
    AddressBook { attempt: usize },
}

/// Find addresses for a freshly connected peer.
///
/// Tries the cache, then the connection's remote address, then polls the
/// address book on the retry schedule. None once the schedule is exhausted.
pub async fn resolve_addresses<S: Substrate + ?Sized>(
    substrate: &S,
    cache: &AddressCache,
    peer: &PeerId,
    policy: &RetryPolicy,
) -> Option<(AddressSource, Vec<String>)> {
    if let Some(cached) = cache.get(peer).filter(|a| !a.is_empty()) {
        return Some((AddressSource::Cache, cached));
    }

    let remote: Vec<String> = substrate
        .connections()
        .into_iter()
        .filter(|(id, addr)| id == peer && !addr.is_empty())
        .map(|(_, addr)| addr)
        .collect();
    if !remote.is_empty() {
        return Some((AddressSource::RemoteAddress, remote));
    }

    let book = substrate.address_book(peer);
    if !book.is_empty() {
        return Some((AddressSource::AddressBook { attempt: 0 }, book));
    }
    for (i, delay) in policy.delays().iter().enumerate() {
        tokio::time::sleep(*delay).await;
        let book = substrate.address_book(peer);
        if !book.is_empty() {
            return Some((AddressSource::AddressBook { attempt: i + 1 }, book));
        }
    }

    tracing::debug!(
        peer = %peer.short(),
        attempts = policy.attempts(),
        "no addresses learned for connected peer"
    );
    None
}
