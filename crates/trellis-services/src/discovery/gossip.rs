//! Gossip peer-list exchange.
//!
//! Each peer periodically publishes itself plus every connected peer whose
//! addresses it knows. A receiver that is not the sender turns the list into
//! candidates, which makes a two-hop peer dialable as soon as the peer in
//! between relays it.

use bytes::Bytes;

use trellis_core::peer::PeerId;
use trellis_core::substrate::{GossipMessage, Substrate};
use trellis_core::wire::{PeerList, PeerListEntry, PEER_LIST_TOPIC};

use super::{dedup_candidates, Candidate, DiscoveryError};
use crate::cache::AddressCache;
use crate::tracker::ConnectionTracker;

pub struct GossipPeerList {
    topic: String,
}

impl Default for GossipPeerList {
    fn default() -> Self {
        Self::new(PEER_LIST_TOPIC)
    }
}

impl GossipPeerList {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Us plus every tracked peer with cached addresses.
    pub fn snapshot(
        &self,
        local: &PeerId,
        own_addresses: Vec<String>,
        tracker: &ConnectionTracker,
        cache: &AddressCache,
        now_ms: u64,
    ) -> PeerList {
        let mut peers = vec![PeerListEntry {
            peer_id: local.clone(),
            addresses: own_addresses,
        }];
        let mut connected = tracker.snapshot();
        connected.sort();
        for peer in connected {
            if &peer == local {
                continue;
            }
            if let Some(addresses) = cache.get(&peer).filter(|a| !a.is_empty()) {
                peers.push(PeerListEntry {
                    peer_id: peer,
                    addresses,
                });
            }
        }
        PeerList::new(local.clone(), peers, now_ms)
    }

    pub async fn publish<S: Substrate + ?Sized>(
        &self,
        substrate: &S,
        list: &PeerList,
    ) -> Result<(), DiscoveryError> {
        substrate
            .publish(&self.topic, Bytes::from(list.encode()))
            .await?;
        Ok(())
    }

    /// Turn a received message into candidates.
    ///
    /// Our own lists (echoed back by the mesh) yield nothing, and we never
    /// appear as a candidate ourselves.
    pub fn candidates(
        &self,
        message: &GossipMessage,
        local: &PeerId,
    ) -> Result<Vec<Candidate>, DiscoveryError> {
        if &message.from == local {
            return Ok(Vec::new());
        }
        let list = PeerList::decode(&message.data)?;
        if &list.sender == local {
            return Ok(Vec::new());
        }
        let candidates = list
            .peers
            .into_iter()
            .filter(|entry| &entry.peer_id != local && !entry.peer_id.is_empty())
            .map(|entry| Candidate::new(entry.peer_id, entry.addresses))
            .collect();
        Ok(dedup_candidates(candidates))
    }
}
