//! Discovery coordinator: one per process.
//!
//! Owns the connection tracker, address cache and store handle, runs every
//! discovery strategy and reconciliation job, and is the only thing that
//! dials. Candidates from all sources go through `consider`, which filters
//! against the tracker and the per-peer dial state before spawning a dial.
//!
//! Per-peer state: absent (unknown) → Dialing → Connected. A dial that fails
//! on every address drops the entry, so the peer is unknown again and is
//! dialed whenever a later cycle offers it. Connected is left only on a
//! disconnect event.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use trellis_core::clock::SharedClock;
use trellis_core::config::TrellisConfig;
use trellis_core::peer::PeerId;
use trellis_core::substrate::{GossipMessage, PeerEvent, Substrate};
use trellis_core::wire::Announcement;

use crate::cache::AddressCache;
use crate::discovery::{
    dedup_candidates, BootstrapExchange, Candidate, DhtDiscovery, FileBoard, GossipPeerList,
    RendezvousBoard, Source,
};
use crate::scheduler::{every, Reconciler};
use crate::store::PeerStore;
use crate::tracker::{resolve_addresses, ConnectionTracker, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialState {
    Dialing,
    Connected,
}

pub struct Coordinator<S: Substrate + ?Sized> {
    substrate: Arc<S>,
    local: PeerId,
    store: PeerStore,
    cache: AddressCache,
    tracker: ConnectionTracker,
    states: DashMap<PeerId, DialState>,
    config: TrellisConfig,
    clock: SharedClock,
    retry: RetryPolicy,
    bootstrap: Option<BootstrapExchange>,
    dht: DhtDiscovery,
    gossip: GossipPeerList,
    reconciler: Reconciler<S>,
}

impl<S: Substrate + ?Sized> Coordinator<S> {
    pub fn new(substrate: Arc<S>, store: PeerStore, config: TrellisConfig, clock: SharedClock) -> Self {
        let local = substrate.local_peer_id();
        let cache = AddressCache::new();
        let tracker = ConnectionTracker::new();
        let reconciler = Reconciler::new(
            substrate.clone(),
            store.clone(),
            cache.clone(),
            tracker.clone(),
            clock.clone(),
            &config.reconciliation,
        );
        let board: Arc<dyn RendezvousBoard> =
            Arc::new(FileBoard::new(config.bootstrap.board_path.clone()));
        let bootstrap = Self::bootstrap_exchange(&config, board);

        Self {
            substrate,
            local,
            store,
            cache,
            tracker,
            states: DashMap::new(),
            retry: RetryPolicy::new(config.discovery.address_retry_delays()),
            dht: DhtDiscovery::new(Duration::from_secs(config.discovery.announce_ttl_secs)),
            gossip: GossipPeerList::default(),
            bootstrap,
            reconciler,
            config,
            clock,
        }
    }

    /// Use `board` for bootstrap exchange instead of the configured file.
    pub fn with_board(mut self, board: Arc<dyn RendezvousBoard>) -> Self {
        self.bootstrap = Self::bootstrap_exchange(&self.config, board);
        self
    }

    fn bootstrap_exchange(
        config: &TrellisConfig,
        board: Arc<dyn RendezvousBoard>,
    ) -> Option<BootstrapExchange> {
        let target = config.bootstrap.target_peer()?;
        Some(BootstrapExchange::new(
            board,
            target,
            Duration::from_secs(config.bootstrap.poll_interval_secs),
            config.bootstrap.max_poll_attempts,
        ))
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local
    }

    pub fn dial_state(&self, peer: &PeerId) -> Option<DialState> {
        self.states.get(peer).map(|s| *s)
    }

    /// Peers with a dial in flight or an established connection.
    pub fn tracked_dials(&self) -> usize {
        self.states.len()
    }

    /// Currently connected peers, sorted.
    pub fn connected(&self) -> Vec<PeerId> {
        let mut peers = self.tracker.snapshot();
        peers.sort();
        peers
    }

    pub fn cache(&self) -> &AddressCache {
        &self.cache
    }

    pub fn store(&self) -> &PeerStore {
        &self.store
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn reconciler(&self) -> &Reconciler<S> {
        &self.reconciler
    }

    /// Our own announcement, with advertised (possibly rewritten) addresses.
    pub fn self_announcement(&self) -> Announcement {
        let addresses = self
            .substrate
            .listen_addresses()
            .iter()
            .map(|a| {
                self.config
                    .network
                    .advertised(a, &self.config.node.instance_name)
            })
            .collect();
        Announcement::new(self.local.clone(), addresses, self.clock.now_ms())
    }

    // ── Commit path ──────────────────────────────────────────────────────────

    /// Merge `fresh` into the cache, then persist the merged list. A store
    /// failure is logged and the cache keeps serving.
    fn commit(&self, peer: &PeerId, fresh: &[String]) -> Vec<String> {
        let merged = self.cache.merge(peer.clone(), fresh);
        if merged.is_empty() {
            return merged;
        }
        if let Err(e) = self.store.upsert(peer, &merged) {
            tracing::warn!(peer = %peer.short(), error = %e, "failed to persist peer");
        }
        merged
    }

    // ── Substrate events ─────────────────────────────────────────────────────

    pub fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Connected(peer) => {
                if peer == self.local {
                    return;
                }
                if self.tracker.connected(peer.clone()) {
                    tracing::info!(peer = %peer.short(), "peer connected");
                }
                self.states.insert(peer.clone(), DialState::Connected);

                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let found =
                        resolve_addresses(this.substrate.as_ref(), &this.cache, &peer, &this.retry)
                            .await;
                    if let Some((source, addresses)) = found {
                        // Peer may have gone while we polled.
                        if !this.tracker.contains(&peer) {
                            return;
                        }
                        let merged = this.commit(&peer, &addresses);
                        tracing::debug!(
                            peer = %peer.short(),
                            source = ?source,
                            addresses = merged.len(),
                            "recorded connected peer"
                        );
                    }
                });
            }
            PeerEvent::Disconnected(peer) => {
                if self.tracker.disconnected(&peer) {
                    tracing::info!(peer = %peer.short(), "peer disconnected");
                }
                self.states.remove(&peer);
            }
        }
    }

    // ── Candidates ───────────────────────────────────────────────────────────

    /// Record every sighting and start a background dial for each candidate
    /// that is neither us, connected, nor already being dialed.
    ///
    /// Returns the number of dials started.
    pub fn consider(self: &Arc<Self>, candidates: Vec<Candidate>, source: Source) -> usize {
        let mut started = 0;
        for candidate in dedup_candidates(candidates) {
            if candidate.peer_id == self.local || candidate.peer_id.is_empty() {
                continue;
            }
            // Stored records are not fresh sightings; re-upserting them
            // would refresh last_seen and defeat pruning.
            if source != Source::Store {
                self.commit(&candidate.peer_id, &candidate.addresses);
            }
            if self.tracker.contains(&candidate.peer_id) {
                continue;
            }
            match self.states.entry(candidate.peer_id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(e) => {
                    e.insert(DialState::Dialing);
                }
            }

            tracing::debug!(
                peer = %candidate.peer_id.short(),
                source = source.as_str(),
                addresses = candidate.addresses.len(),
                "dialing candidate"
            );
            let this = Arc::clone(self);
            tokio::spawn(async move { this.dial_candidate(candidate, source).await });
            started += 1;
        }
        started
    }

    /// Try each address in order until one dial reaches the expected peer.
    async fn dial_candidate(&self, candidate: Candidate, source: Source) {
        let peer = candidate.peer_id;
        for address in &candidate.addresses {
            match self.substrate.dial(address).await {
                Ok(id) if id == peer => {
                    self.commit(&peer, std::slice::from_ref(address));
                    if let Some(mut state) = self.states.get_mut(&peer) {
                        if *state == DialState::Dialing {
                            *state = DialState::Connected;
                        }
                    }
                    tracing::debug!(
                        peer = %peer.short(),
                        source = source.as_str(),
                        address = %address,
                        "dial succeeded"
                    );
                    return;
                }
                Ok(id) => {
                    tracing::debug!(
                        peer = %peer.short(),
                        answered = %id.short(),
                        address = %address,
                        "address belongs to another peer"
                    );
                }
                Err(e) => {
                    tracing::debug!(
                        peer = %peer.short(),
                        address = %address,
                        error = %e,
                        "dial failed"
                    );
                }
            }
        }

        self.states
            .remove_if(&peer, |_, state| *state == DialState::Dialing);
        tracing::debug!(
            peer = %peer.short(),
            source = source.as_str(),
            tried = candidate.addresses.len(),
            "all addresses failed"
        );
    }

    // ── Strategy cycles ──────────────────────────────────────────────────────

    pub fn handle_gossip(self: &Arc<Self>, message: &GossipMessage) -> usize {
        match self.gossip.candidates(message, &self.local) {
            Ok(candidates) => self.consider(candidates, Source::Gossip),
            Err(e) => {
                tracing::trace!(from = %message.from.short(), error = %e, "discarding peer list");
                0
            }
        }
    }

    /// Publish our peer list to the mesh.
    pub async fn gossip_cycle(&self) {
        let list = self.gossip.snapshot(
            &self.local,
            self.self_announcement().addresses,
            &self.tracker,
            &self.cache,
            self.clock.now_ms(),
        );
        let listed = list.peers.len();
        match self.gossip.publish(self.substrate.as_ref(), &list).await {
            Ok(()) => tracing::debug!(peers = listed, "published peer list"),
            Err(e) => tracing::debug!(error = %e, "peer list publish failed"),
        }
    }

    /// Announce ourselves under the shared key, then read everyone else.
    pub async fn dht_cycle(self: &Arc<Self>) -> usize {
        let own = self.self_announcement();
        if let Err(e) = self.dht.announce(self.substrate.as_ref(), &own).await {
            tracing::debug!(error = %e, "dht announce failed");
        }
        match self
            .dht
            .query(self.substrate.as_ref(), &self.local, self.clock.now_ms())
            .await
        {
            Ok(candidates) => self.consider(candidates, Source::Dht),
            Err(e) => {
                tracing::debug!(error = %e, "dht query failed");
                0
            }
        }
    }

    /// Rendezvous: republish our addresses. Joiner: poll the board unless
    /// the rendezvous peer is already connected.
    pub async fn bootstrap_cycle(self: &Arc<Self>) -> usize {
        let Some(bootstrap) = &self.bootstrap else {
            return 0;
        };
        if bootstrap.is_rendezvous(&self.local) {
            if let Err(e) = bootstrap.publish(&self.self_announcement()) {
                tracing::debug!(error = %e, "rendezvous publish failed");
            }
            return 0;
        }
        if self.tracker.contains(bootstrap.target()) {
            return 0;
        }
        match bootstrap.poll().await {
            Ok(candidates) => self.consider(candidates, Source::Bootstrap),
            Err(e) => {
                tracing::debug!(error = %e, "bootstrap exchange failed");
                0
            }
        }
    }

    /// Seed the cache from the store and offer stored peers as candidates.
    pub fn restore(self: &Arc<Self>) -> usize {
        let records = match self.store.list() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read peer store, starting empty");
                return 0;
            }
        };
        self.cache.seed(&records);
        let candidates = records
            .into_iter()
            .map(|r| Candidate::new(r.peer_id, r.addresses))
            .collect();
        let started = self.consider(candidates, Source::Store);
        tracing::info!(
            known = self.cache.len(),
            dialing = started,
            "restored peers from store"
        );
        started
    }

    // ── Run loop ─────────────────────────────────────────────────────────────

    /// Run every loop until `shutdown` fires. In-flight dials are left to
    /// finish on their own.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) {
        let mut stop = shutdown.subscribe();
        let events = self.substrate.events();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tracing::info!(
            peer = %self.local,
            instance = %self.config.node.instance_name,
            "discovery coordinator starting"
        );

        tasks.push(tokio::spawn(Self::event_loop(
            self.clone(),
            events,
            shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(Self::gossip_receive_loop(
            self.clone(),
            shutdown.subscribe(),
        )));

        self.restore();

        let discovery = &self.config.discovery;
        {
            let this = self.clone();
            let mut rx = shutdown.subscribe();
            let period = Duration::from_secs(discovery.dht_interval_secs);
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = rx.recv() => return,
                    _ = this.dht_cycle() => {}
                }
                every("dht", period, rx, move || {
                    let this = this.clone();
                    async move {
                        this.dht_cycle().await;
                    }
                })
                .await
            }));
        }
        {
            let this = self.clone();
            let period = Duration::from_secs(discovery.gossip_interval_secs);
            tasks.push(tokio::spawn(every("gossip", period, shutdown.subscribe(), move || {
                let this = this.clone();
                async move { this.gossip_cycle().await }
            })));
        }
        if let Some(bootstrap) = &self.bootstrap {
            let period = if bootstrap.is_rendezvous(&self.local) {
                Duration::from_secs(self.config.bootstrap.publish_interval_secs)
            } else {
                Duration::from_secs(self.config.bootstrap.retry_interval_secs)
            };
            let this = self.clone();
            let mut rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = rx.recv() => return,
                    _ = this.bootstrap_cycle() => {}
                }
                every("bootstrap", period, rx, move || {
                    let this = this.clone();
                    async move {
                        this.bootstrap_cycle().await;
                    }
                })
                .await
            }));
        }

        let reconciliation = &self.config.reconciliation;
        {
            let this = self.clone();
            let period = Duration::from_secs(reconciliation.persist_interval_secs);
            tasks.push(tokio::spawn(every("persist", period, shutdown.subscribe(), move || {
                let this = this.clone();
                async move {
                    this.reconciler.persist_connected();
                }
            })));
        }
        {
            let this = self.clone();
            let period = Duration::from_secs(reconciliation.prune_interval_secs);
            tasks.push(tokio::spawn(every("prune", period, shutdown.subscribe(), move || {
                let this = this.clone();
                async move {
                    if let Err(e) = this.reconciler.prune() {
                        tracing::warn!(error = %e, "prune failed");
                    }
                }
            })));
        }
        {
            let this = self.clone();
            let period = Duration::from_secs(reconciliation.stats_interval_secs);
            tasks.push(tokio::spawn(every("stats", period, shutdown.subscribe(), move || {
                let this = this.clone();
                async move {
                    this.reconciler.stats();
                }
            })));
        }

        let _ = stop.recv().await;
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "coordinator task panicked");
            }
        }
        tracing::info!(peer = %self.local.short(), "discovery coordinator stopped");
    }

    async fn event_loop(
        self: Arc<Self>,
        mut events: futures::stream::BoxStream<'static, PeerEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                event = events.next() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        tracing::debug!("substrate event stream closed");
                        return;
                    }
                },
            }
        }
    }

    async fn gossip_receive_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut messages = match self.substrate.subscribe(self.gossip.topic()).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(topic = self.gossip.topic(), error = %e, "gossip subscribe failed");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                message = messages.next() => match message {
                    Some(message) => {
                        self.handle_gossip(&message);
                    }
                    None => {
                        tracing::debug!("gossip subscription closed");
                        return;
                    }
                },
            }
        }
    }
}
