//! The networking substrate this layer runs on.
//!
//! Transport, encryption, multiplexing, the pub/sub mesh and DHT routing all
//! live behind this trait. Trellis only sees identities, addresses, events
//! and byte payloads.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::peer::PeerId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubstrateError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("dht operation failed: {0}")]
    Dht(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("address in use: {0}")]
    AddressInUse(String),
    #[error("substrate closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Connection lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone)]
pub struct GossipMessage {
    pub topic: String,
    /// The peer the message originated from (not the relaying hop).
    pub from: PeerId,
    pub data: Bytes,
}

#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    /// Our own peer id.
    fn local_peer_id(&self) -> PeerId;

    /// Addresses we are listening on, as the substrate reports them.
    fn listen_addresses(&self) -> Vec<String>;

    /// Dial an address. Dialing an already-connected peer succeeds without
    /// opening a second connection. Timeouts are the substrate's concern.
    async fn dial(&self, address: &str) -> Result<PeerId>;

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, GossipMessage>>;

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()>;

    /// Connect/disconnect notifications from now on.
    fn events(&self) -> BoxStream<'static, PeerEvent>;

    /// Live connections with the remote address of each.
    fn connections(&self) -> Vec<(PeerId, String)>;

    /// Addresses the substrate has learned for a peer. May lag behind the
    /// connect event.
    fn address_book(&self, peer: &PeerId) -> Vec<String>;

    async fn dht_put(&self, key: &[u8], value: Bytes) -> Result<()>;

    /// Read every value stored under `key`, one record per writer/replica.
    ///
    /// The stream is lazy, finite and cannot be restarted.
    fn dht_get(&self, key: &[u8]) -> BoxStream<'static, Result<Bytes>>;
}
