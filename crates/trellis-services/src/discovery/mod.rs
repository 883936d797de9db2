//! Discovery strategies: independent sources of dialable candidates.
//!
//! Each strategy produces `Candidate`s or a `DiscoveryError`. Nothing here
//! dials; the coordinator filters candidates against the connection tracker
//! and does the dialing.

use std::collections::HashMap;

use trellis_core::peer::{merge_addresses, PeerId};
use trellis_core::substrate::SubstrateError;
use trellis_core::wire::WireError;

pub mod bootstrap;
pub mod dht;
pub mod gossip;

pub use bootstrap::{BootstrapExchange, FileBoard, MemoryBoard, RendezvousBoard};
pub use dht::DhtDiscovery;
pub use gossip::GossipPeerList;

/// Which strategy produced a candidate. Carried into logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Bootstrap,
    Dht,
    Gossip,
    Store,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Bootstrap => "bootstrap",
            Source::Dht => "dht",
            Source::Gossip => "gossip",
            Source::Store => "store",
        }
    }
}

/// A peer we could try to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub peer_id: PeerId,
    pub addresses: Vec<String>,
}

impl Candidate {
    pub fn new(peer_id: PeerId, addresses: Vec<String>) -> Self {
        Self { peer_id, addresses }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The substrate or the rendezvous location could not be reached.
    /// Retried on the next cycle.
    #[error("unreachable: {0}")]
    Unreachable(#[from] SubstrateError),
    #[error("rendezvous board unavailable: {0}")]
    Board(#[from] std::io::Error),
    #[error("malformed payload: {0}")]
    Malformed(#[from] WireError),
    /// Bootstrap polling ran out of attempts before the target appeared.
    #[error("rendezvous peer {0} not published after {1} attempts")]
    NotPublished(PeerId, u32),
}

/// Collapse candidates by peer id, merging their addresses in order.
pub fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut order: Vec<PeerId> = Vec::new();
    let mut merged: HashMap<PeerId, Vec<String>> = HashMap::new();
    for c in candidates {
        match merged.get_mut(&c.peer_id) {
            Some(existing) => *existing = merge_addresses(existing, &c.addresses),
            None => {
                order.push(c.peer_id.clone());
                merged.insert(c.peer_id, merge_addresses(&c.addresses, &[]));
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| {
            let addresses = merged.remove(&id)?;
            (!addresses.is_empty()).then(|| Candidate::new(id, addresses))
        })
        .collect()
}
