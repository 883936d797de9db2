//! Trellis integration test harness.
//!
//! Tests run whole coordinators against a shared `MemoryNetwork` on a paused
//! tokio clock, so multi-minute discovery schedules finish instantly and
//! deterministically. Wall-clock timestamps come from one `ManualClock` per
//! test, advanced explicitly where a test needs records to age.
//!
//!   cargo test --test integration

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use trellis_core::clock::{ManualClock, SharedClock};
use trellis_core::config::TrellisConfig;
use trellis_core::peer::PeerId;
use trellis_core::substrate::Substrate;
use trellis_services::{Coordinator, MemoryNetwork, MemoryNode, PeerStore, RendezvousBoard};

mod bootstrap;
mod discovery;
mod healing;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Wall-clock start for every test.
pub const T0: u64 = 1_700_000_000_000;

/// One running node: substrate endpoint plus its coordinator task.
pub struct TestNode {
    pub name: String,
    pub node: Arc<MemoryNode>,
    pub coordinator: Arc<Coordinator<MemoryNode>>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl TestNode {
    pub fn id(&self) -> PeerId {
        self.node.local_peer_id()
    }

    pub fn address(&self) -> String {
        self.node.listen_addresses()[0].clone()
    }

    pub fn is_connected_to(&self, other: &TestNode) -> bool {
        self.coordinator.tracker().contains(&other.id())
    }

    /// Stop the coordinator, then take the node off the network.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await.context("coordinator task panicked")?;
        self.node.shutdown();
        Ok(())
    }
}

pub fn config(name: &str) -> TrellisConfig {
    let mut config = TrellisConfig::default();
    config.node.instance_name = name.to_string();
    config
}

/// Start a node named `name` with an in-memory store.
pub async fn spawn_node(net: &MemoryNetwork, clock: &Arc<ManualClock>, name: &str) -> TestNode {
    let shared: SharedClock = clock.clone();
    let store = PeerStore::open_in_memory(shared).expect("in-memory store");
    spawn_with(net, clock, name, config(name), store, None).await
}

/// Start a node with an explicit config, store and optional board.
pub async fn spawn_with(
    net: &MemoryNetwork,
    clock: &Arc<ManualClock>,
    name: &str,
    config: TrellisConfig,
    store: PeerStore,
    board: Option<Arc<dyn RendezvousBoard>>,
) -> TestNode {
    let node = net
        .listen(name, &config.network)
        .expect("listen address in use");
    let mut coordinator = Coordinator::new(node.clone(), store, config, clock.clone());
    if let Some(board) = board {
        coordinator = coordinator.with_board(board);
    }
    let coordinator = Arc::new(coordinator);
    let (shutdown, _) = broadcast::channel(1);
    let task = tokio::spawn(coordinator.clone().run(shutdown.clone()));

    // Let the coordinator subscribe to events before anyone dials.
    tokio::time::sleep(Duration::from_millis(10)).await;

    TestNode {
        name: name.to_string(),
        node,
        coordinator,
        shutdown,
        task,
    }
}

/// Open an on-disk store under `dir`.
pub fn file_store(dir: &Path, name: &str, clock: &Arc<ManualClock>) -> Result<PeerStore> {
    let shared: SharedClock = clock.clone();
    PeerStore::open(dir.join(format!("peer-db-{name}.db")), shared)
        .with_context(|| format!("failed to open store for {name}"))
}

/// Seed a direct connection from `from` to `to`.
pub async fn link(from: &TestNode, to: &TestNode) -> Result<()> {
    from.node
        .dial(&to.address())
        .await
        .with_context(|| format!("{} failed to dial {}", from.name, to.name))?;
    Ok(())
}

/// Poll `cond` every 100ms of virtual time until it holds or `timeout` passes.
pub async fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Every pair of nodes is connected.
pub fn fully_meshed(nodes: &[&TestNode]) -> bool {
    nodes.iter().all(|a| {
        nodes
            .iter()
            .all(|b| a.id() == b.id() || a.is_connected_to(b))
    })
}
