//! Peer identity and the durable peer record.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable opaque identifier for a participant, independent of its addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a deterministic id from a seed (instance name, test label).
    ///
    /// BLAKE3 of the seed, first 16 bytes hex-encoded.
    pub fn derive(seed: &[u8]) -> Self {
        let hash = blake3::hash(seed);
        Self(hex::encode(&hash.as_bytes()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last 8 characters, for log lines.
    pub fn short(&self) -> &str {
        let start = self.0.len().saturating_sub(8);
        self.0.get(start..).unwrap_or(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A known peer as persisted in the peer store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Dialable addresses, most recently confirmed first. Never empty.
    pub addresses: Vec<String>,
    /// Unix ms of the last confirmed liveness.
    pub last_seen: u64,
    /// Unix seconds when the peer was first recorded. Never changes.
    pub created_at: u64,
}

/// Merge freshly confirmed addresses in front of previously known ones.
///
/// Order is fresh-first, then known; duplicates and empty strings dropped.
pub fn merge_addresses(fresh: &[String], known: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(fresh.len() + known.len());
    for addr in fresh.iter().chain(known.iter()) {
        if addr.is_empty() || merged.contains(addr) {
            continue;
        }
        merged.push(addr.clone());
    }
    merged
}

/// De-duplicate an address list, keeping first occurrences.
pub fn dedup_addresses(addresses: &[String]) -> Vec<String> {
    merge_addresses(addresses, &[])
}
