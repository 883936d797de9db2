//! In-process substrate.
//!
//! A `MemoryNetwork` hosts any number of `MemoryNode`s that dial each other
//! by address. Connections are symmetric and raise connect/disconnect events
//! on both ends; topic messages reach directly connected subscribers only
//! (a one-hop mesh); the DHT is a single network-wide map holding one value
//! per writer under each key. Used by the simulation daemon and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc};

use trellis_core::config::NetworkConfig;
use trellis_core::peer::PeerId;
use trellis_core::substrate::{GossipMessage, PeerEvent, Result, Substrate, SubstrateError};

const FIRST_PORT: u16 = 40_000;

struct NetworkInner {
    by_addr: DashMap<String, Arc<MemoryNode>>,
    dht: DashMap<Vec<u8>, HashMap<PeerId, Bytes>>,
    dht_available: AtomicBool,
    next_port: AtomicU16,
    /// How long after a connection each side learns the other's listen
    /// addresses. Zero = immediately.
    address_book_delay: Duration,
}

#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_address_book_delay(Duration::ZERO)
    }

    pub fn with_address_book_delay(delay: Duration) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                by_addr: DashMap::new(),
                dht: DashMap::new(),
                dht_available: AtomicBool::new(true),
                next_port: AtomicU16::new(FIRST_PORT),
                address_book_delay: delay,
            }),
        }
    }

    /// Start a node whose id is derived from `name`, on the next free
    /// loopback port.
    pub fn node(&self, name: &str) -> Arc<MemoryNode> {
        let id = PeerId::derive(name.as_bytes());
        let port = self.next_port();
        let address = format!("/ip4/127.0.0.1/tcp/{port}/p2p/{id}");
        let node = self.build(id, address.clone(), None);
        self.inner.by_addr.insert(address, node.clone());
        node
    }

    /// Start a node on the listen address `config` describes. Port 0 picks
    /// the next free port. In networked mode the node is also reachable at
    /// its `/dns4/<name>` address.
    pub fn listen(&self, name: &str, config: &NetworkConfig) -> Result<Arc<MemoryNode>> {
        let id = PeerId::derive(name.as_bytes());
        let mut network = config.clone();
        if network.port == 0 {
            network.port = self.next_port();
        }
        let address = format!("{}/p2p/{id}", network.listen_address());
        let advertised = network.advertised(&address, name);
        let alias = (advertised != address).then_some(advertised);

        let taken = |a: &String| self.inner.by_addr.contains_key(a);
        if taken(&address) || alias.as_ref().is_some_and(taken) {
            return Err(SubstrateError::AddressInUse(address));
        }
        let node = self.build(id, address.clone(), alias.clone());
        self.inner.by_addr.insert(address, node.clone());
        if let Some(alias) = alias {
            self.inner.by_addr.insert(alias, node.clone());
        }
        Ok(node)
    }

    fn next_port(&self) -> u16 {
        self.inner.next_port.fetch_add(1, Ordering::Relaxed)
    }

    fn build(&self, id: PeerId, address: String, alias: Option<String>) -> Arc<MemoryNode> {
        let (events, _) = broadcast::channel(256);
        Arc::new_cyclic(|me| MemoryNode {
            me: me.clone(),
            id,
            address,
            alias,
            network: self.inner.clone(),
            online: AtomicBool::new(true),
            dial_attempts: AtomicUsize::new(0),
            events,
            state: Mutex::new(NodeState::default()),
        })
    }

    /// Make every `dht_get` fail until re-enabled.
    pub fn set_dht_available(&self, available: bool) {
        self.inner.dht_available.store(available, Ordering::SeqCst);
    }

    /// Write a raw DHT value as if `writer` had put it.
    pub fn dht_inject(&self, key: &[u8], writer: PeerId, value: Bytes) {
        self.inner
            .dht
            .entry(key.to_vec())
            .or_default()
            .insert(writer, value);
    }

    /// Number of values currently stored under `key`.
    pub fn dht_len(&self, key: &[u8]) -> usize {
        self.inner.dht.get(key).map(|v| v.len()).unwrap_or(0)
    }

    pub fn online_nodes(&self) -> usize {
        self.inner
            .by_addr
            .iter()
            .filter(|n| n.key() == &n.value().address)
            .count()
    }
}

#[derive(Default)]
struct NodeState {
    /// peer → remote address of the connection.
    connections: HashMap<PeerId, String>,
    address_book: HashMap<PeerId, Vec<String>>,
    subscriptions: HashMap<String, Vec<mpsc::UnboundedSender<GossipMessage>>>,
}

pub struct MemoryNode {
    me: Weak<MemoryNode>,
    id: PeerId,
    address: String,
    /// Second address the node answers on (networked mode).
    alias: Option<String>,
    network: Arc<NetworkInner>,
    online: AtomicBool,
    dial_attempts: AtomicUsize,
    events: broadcast::Sender<PeerEvent>,
    state: Mutex<NodeState>,
}

impl std::fmt::Debug for MemoryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNode")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl MemoryNode {
    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Total `dial` calls made by this node, successful or not.
    pub fn dial_attempts(&self) -> usize {
        self.dial_attempts.load(Ordering::SeqCst)
    }

    pub fn is_connected_to(&self, peer: &PeerId) -> bool {
        self.lock().connections.contains_key(peer)
    }

    /// Address other nodes learn for us.
    fn dialable_address(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.address.clone())
    }

    /// Record an address in the address book, as identify would.
    pub fn learn_address(&self, peer: &PeerId, address: &str) {
        let mut state = self.lock();
        let book = state.address_book.entry(peer.clone()).or_default();
        if !book.iter().any(|a| a == address) {
            book.push(address.to_string());
        }
    }

    /// Register the connection on this side. Returns false if it existed.
    fn attach(&self, peer: &PeerId, remote_address: &str) -> bool {
        let inserted = self
            .lock()
            .connections
            .insert(peer.clone(), remote_address.to_string())
            .is_none();
        if inserted {
            let _ = self.events.send(PeerEvent::Connected(peer.clone()));
        }
        inserted
    }

    fn detach(&self, peer: &PeerId) -> bool {
        let removed = self.lock().connections.remove(peer).is_some();
        if removed {
            let _ = self.events.send(PeerEvent::Disconnected(peer.clone()));
        }
        removed
    }

    fn schedule_address_learning(&self, peer: PeerId, address: String) {
        let delay = self.network.address_book_delay;
        if delay.is_zero() {
            self.learn_address(&peer, &address);
            return;
        }
        let node = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(node) = node.upgrade() {
                node.learn_address(&peer, &address);
            }
        });
    }

    /// Close one connection from this side.
    pub fn disconnect(&self, peer: &PeerId) {
        if self.detach(peer) {
            if let Some(remote) = self.find_node(peer) {
                remote.detach(&self.id);
            }
        }
    }

    /// Take the node off the network: drop every connection and subscription.
    pub fn shutdown(&self) {
        if !self.online.swap(false, Ordering::SeqCst) {
            return;
        }
        self.network.by_addr.remove(&self.address);
        if let Some(alias) = &self.alias {
            self.network.by_addr.remove(alias);
        }
        let peers: Vec<PeerId> = self.lock().connections.keys().cloned().collect();
        for peer in peers {
            self.disconnect(&peer);
        }
        self.lock().subscriptions.clear();
        tracing::debug!(peer = %self.id.short(), "memory node shut down");
    }

    fn find_node(&self, peer: &PeerId) -> Option<Arc<MemoryNode>> {
        self.network
            .by_addr
            .iter()
            .find(|n| &n.value().id == peer)
            .map(|n| n.value().clone())
    }

    fn deliver(&self, message: &GossipMessage) {
        let mut state = self.lock();
        if let Some(subs) = state.subscriptions.get_mut(&message.topic) {
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }
}

#[async_trait]
impl Substrate for MemoryNode {
    fn local_peer_id(&self) -> PeerId {
        self.id.clone()
    }

    fn listen_addresses(&self) -> Vec<String> {
        vec![self.address.clone()]
    }

    async fn dial(&self, address: &str) -> Result<PeerId> {
        self.dial_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.is_online() {
            return Err(SubstrateError::Closed);
        }
        let remote = self
            .network
            .by_addr
            .get(address)
            .map(|n| n.value().clone())
            .ok_or_else(|| SubstrateError::Unreachable(address.to_string()))?;
        if remote.id == self.id {
            return Err(SubstrateError::Unreachable("cannot dial self".to_string()));
        }
        if !remote.is_online() {
            return Err(SubstrateError::Unreachable(address.to_string()));
        }

        if self.attach(&remote.id, address) {
            remote.attach(&self.id, &self.address);
            self.schedule_address_learning(remote.id.clone(), remote.dialable_address());
            remote.schedule_address_learning(self.id.clone(), self.dialable_address());
        }
        Ok(remote.id.clone())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, GossipMessage>> {
        if !self.is_online() {
            return Err(SubstrateError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) }).boxed())
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        if !self.is_online() {
            return Err(SubstrateError::Closed);
        }
        let message = GossipMessage {
            topic: topic.to_string(),
            from: self.id.clone(),
            data,
        };
        let peers: Vec<PeerId> = self.lock().connections.keys().cloned().collect();
        for peer in peers {
            if let Some(remote) = self.find_node(&peer) {
                remote.deliver(&message);
            }
        }
        // Our own subscriptions hear our publishes too.
        self.deliver(&message);
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, PeerEvent> {
        let rx = self.events.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "peer event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    fn connections(&self) -> Vec<(PeerId, String)> {
        self.lock()
            .connections
            .iter()
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect()
    }

    fn address_book(&self, peer: &PeerId) -> Vec<String> {
        self.lock()
            .address_book
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    async fn dht_put(&self, key: &[u8], value: Bytes) -> Result<()> {
        if !self.is_online() {
            return Err(SubstrateError::Closed);
        }
        self.network
            .dht
            .entry(key.to_vec())
            .or_default()
            .insert(self.id.clone(), value);
        Ok(())
    }

    fn dht_get(&self, key: &[u8]) -> BoxStream<'static, Result<Bytes>> {
        if !self.network.dht_available.load(Ordering::SeqCst) {
            return stream::iter(vec![Err(SubstrateError::Dht("no peers reachable".into()))])
                .boxed();
        }
        let values: Vec<Result<Bytes>> = self
            .network
            .dht
            .get(key)
            .map(|v| v.values().cloned().map(Ok).collect())
            .unwrap_or_default();
        stream::iter(values).boxed()
    }
}
