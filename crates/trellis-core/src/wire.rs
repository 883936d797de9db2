//! Discovery wire formats.
//!
//! Both messages travel as UTF-8 JSON. Anything that fails to parse, or
//! parses with a required field missing or empty, is a `WireError` and the
//! caller drops it.

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Well-known DHT key every peer writes its announcement under.
pub const DHT_ANNOUNCE_KEY: &[u8] = b"/trellis/discovery/peers";

/// Gossip topic carrying peer-list snapshots.
pub const PEER_LIST_TOPIC: &str = "trellis-peer-discovery";

/// Value of the `type` discriminator on peer-list messages.
pub const PEER_LIST_TYPE: &str = "peer-list";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing or empty field: {0}")]
    MissingField(&'static str),
    #[error("unexpected message type: {0}")]
    UnexpectedType(String),
}

// ── Announcement ──────────────────────────────────────────────────────────────

/// A peer advertising where it can be reached.
///
/// Written to the DHT by every peer for itself, and to the rendezvous
/// board by the bootstrap peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub peer_id: PeerId,
    pub addresses: Vec<String>,
    /// Unix ms at which the announcement was produced.
    pub timestamp: u64,
}

impl Announcement {
    pub fn new(peer_id: PeerId, addresses: Vec<String>, timestamp: u64) -> Self {
        Self {
            peer_id,
            addresses,
            timestamp,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Plain strings and integers only; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let ann: Announcement = serde_json::from_slice(bytes)?;
        if ann.peer_id.is_empty() {
            return Err(WireError::MissingField("peerId"));
        }
        Ok(ann)
    }
}

// ── Peer list ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerListEntry {
    pub peer_id: PeerId,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Snapshot of a peer and everyone it is connected to, gossiped so that
/// two-hop peers become dialable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    #[serde(rename = "type")]
    pub kind: String,
    pub peers: Vec<PeerListEntry>,
    pub sender: PeerId,
    pub timestamp: u64,
}

impl PeerList {
    pub fn new(sender: PeerId, peers: Vec<PeerListEntry>, timestamp: u64) -> Self {
        Self {
            kind: PEER_LIST_TYPE.to_string(),
            peers,
            sender,
            timestamp,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let list: PeerList = serde_json::from_slice(bytes)?;
        if list.kind != PEER_LIST_TYPE {
            return Err(WireError::UnexpectedType(list.kind));
        }
        if list.sender.is_empty() {
            return Err(WireError::MissingField("sender"));
        }
        Ok(list)
    }
}
