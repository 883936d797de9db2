//! DHT announce/query over one shared, network-wide key.
//!
//! Every peer writes its own announcement under the same key. The store is
//! replicated and multi-writer, so a read yields many records from many
//! writers in no particular order, possibly several per peer and possibly
//! stale or corrupt. A read is therefore folded into at most one candidate
//! per peer id, newest timestamp wins.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;

use trellis_core::peer::PeerId;
use trellis_core::substrate::Substrate;
use trellis_core::wire::{Announcement, DHT_ANNOUNCE_KEY};

use super::{Candidate, DiscoveryError};

/// How far ahead of our clock an announcement may be stamped and still count.
/// Anything further out would never go stale and would shadow the peer's real
/// announcements.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

pub struct DhtDiscovery {
    key: Vec<u8>,
    ttl: Duration,
}

/// Tally of one read, for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueryStats {
    pub records: usize,
    pub malformed: usize,
    pub stale: usize,
    pub future: usize,
    pub read_errors: usize,
}

impl DhtDiscovery {
    pub fn new(ttl: Duration) -> Self {
        Self {
            key: DHT_ANNOUNCE_KEY.to_vec(),
            ttl,
        }
    }

    /// Write our announcement under the shared key.
    pub async fn announce<S: Substrate + ?Sized>(
        &self,
        substrate: &S,
        own: &Announcement,
    ) -> Result<(), DiscoveryError> {
        substrate
            .dht_put(&self.key, Bytes::from(own.encode()))
            .await?;
        Ok(())
    }

    /// Read every announcement under the shared key.
    ///
    /// Fails only if the read produced errors and no records at all.
    pub async fn query<S: Substrate + ?Sized>(
        &self,
        substrate: &S,
        local: &PeerId,
        now_ms: u64,
    ) -> Result<Vec<Candidate>, DiscoveryError> {
        let mut stream = substrate.dht_get(&self.key);
        let mut stats = QueryStats::default();
        let mut first_error = None;
        let mut newest: HashMap<PeerId, Announcement> = HashMap::new();
        let ttl_ms = self.ttl.as_millis() as u64;
        let horizon_ms = now_ms.saturating_add(MAX_CLOCK_SKEW.as_millis() as u64);

        while let Some(item) = stream.next().await {
            let bytes = match item {
                Ok(b) => b,
                Err(e) => {
                    stats.read_errors += 1;
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            stats.records += 1;

            let ann = match Announcement::decode(&bytes) {
                Ok(a) => a,
                Err(e) => {
                    stats.malformed += 1;
                    tracing::trace!(error = %e, "discarding malformed dht announcement");
                    continue;
                }
            };
            if &ann.peer_id == local || ann.addresses.iter().all(|a| a.is_empty()) {
                continue;
            }
            if ann.timestamp > horizon_ms {
                stats.future += 1;
                tracing::trace!(
                    peer = %ann.peer_id.short(),
                    ahead_ms = ann.timestamp - now_ms,
                    "discarding future-dated dht announcement"
                );
                continue;
            }
            if now_ms.saturating_sub(ann.timestamp) > ttl_ms {
                stats.stale += 1;
                continue;
            }
            match newest.get(&ann.peer_id) {
                Some(existing) if existing.timestamp >= ann.timestamp => {}
                _ => {
                    newest.insert(ann.peer_id.clone(), ann);
                }
            }
        }

        if stats.records == 0 {
            if let Some(e) = first_error {
                return Err(e.into());
            }
        }

        tracing::debug!(
            records = stats.records,
            malformed = stats.malformed,
            stale = stats.stale,
            future = stats.future,
            read_errors = stats.read_errors,
            peers = newest.len(),
            "dht query complete"
        );

        let mut candidates: Vec<Candidate> = newest
            .into_values()
            .map(|a| Candidate::new(a.peer_id, a.addresses))
            .collect();
        candidates.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        Ok(candidates)
    }
}
