//! Cluster of in-process nodes sharing one `MemoryNetwork`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use trellis_core::clock::system_clock;
use trellis_core::config::TrellisConfig;
use trellis_core::peer::PeerId;
use trellis_core::substrate::Substrate;
use trellis_services::{Coordinator, FileBoard, MemoryNetwork, MemoryNode, PeerStore, RendezvousBoard};

struct SimNode {
    name: String,
    node: Arc<MemoryNode>,
    coordinator: Arc<Coordinator<MemoryNode>>,
}

pub struct Simulation {
    nodes: Vec<SimNode>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Simulation {
    /// Create `count` nodes and start a coordinator on each. Node 0 is the
    /// rendezvous peer for everyone.
    pub fn start(
        base: &TrellisConfig,
        root: &Path,
        count: usize,
        address_book_delay: Duration,
    ) -> Result<Self> {
        let network = MemoryNetwork::with_address_book_delay(address_book_delay);
        let file_board = FileBoard::new(root.join("bootstrap.json"));
        tracing::info!(board = %file_board.path().display(), "rendezvous board");
        let board: Arc<dyn RendezvousBoard> = Arc::new(file_board);
        let (shutdown, _) = broadcast::channel(1);
        let clock = system_clock();

        let names: Vec<String> = (0..count)
            .map(|i| format!("{}-{i}", base.node.instance_name))
            .collect();
        let rendezvous = names
            .first()
            .map(|n| PeerId::derive(n.as_bytes()))
            .context("simulation has no nodes")?;

        let mut nodes = Vec::with_capacity(count);
        let mut tasks = Vec::with_capacity(count);
        for (i, name) in names.into_iter().enumerate() {
            let mut config = base.clone();
            if base.network.port != 0 {
                config.network.port = u16::try_from(i)
                    .ok()
                    .and_then(|i| base.network.port.checked_add(i))
                    .with_context(|| format!("no port left for node {name}"))?;
            }
            let node = network
                .listen(&name, &config.network)
                .with_context(|| format!("failed to start node {name}"))?;
            config.node.instance_name = name.clone();
            config.node.store_path = Some(root.join(format!("peer-db-{name}.db")));
            config.bootstrap.target = Some(rendezvous.to_string());

            let store = PeerStore::open(config.node.store_path(), clock.clone())
                .with_context(|| format!("failed to open peer store for {name}"))?;
            let coordinator = Arc::new(
                Coordinator::new(node.clone(), store, config, clock.clone()).with_board(board.clone()),
            );
            tracing::info!(node = %name, peer = %node.local_peer_id(), "node started");

            tasks.push(tokio::spawn(coordinator.clone().run(shutdown.clone())));
            nodes.push(SimNode {
                name,
                node,
                coordinator,
            });
        }

        Ok(Self {
            nodes,
            shutdown,
            tasks,
        })
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn node(&self, index: usize) -> Option<Arc<MemoryNode>> {
        self.nodes.get(index).map(|n| n.node.clone())
    }

    /// Seed connections: each node dials the next two, and nodes past the
    /// third also dial one random earlier node.
    pub async fn seed_ring(&self) {
        let n = self.nodes.len();
        for (i, current) in self.nodes.iter().enumerate() {
            let mut targets: Vec<usize> = (1..=2).map(|j| (i + j) % n).filter(|t| *t != i).collect();
            if i > 2 {
                let random = rand::thread_rng().gen_range(0..i);
                if !targets.contains(&random) {
                    targets.push(random);
                }
            }
            for t in targets {
                let address = &self.nodes[t].node.listen_addresses()[0];
                if let Err(e) = current.node.dial(address).await {
                    tracing::warn!(from = %current.name, to = %self.nodes[t].name, error = %e, "seed dial failed");
                }
            }
        }
        tracing::info!(nodes = n, "seed topology connected");
    }

    pub fn log_progress(&self) {
        let alive = self.alive();
        let converged = self
            .nodes
            .iter()
            .filter(|n| n.node.is_online() && n.coordinator.connected().len() + 1 >= alive)
            .count();
        tracing::info!(alive, converged, "cluster progress");
    }

    fn alive(&self) -> usize {
        self.nodes.iter().filter(|n| n.node.is_online()).count()
    }

    /// Signal shutdown and wait for every coordinator to stop.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "coordinator task failed");
            }
        }
    }

    pub fn print_summary(&self) {
        let alive = self.alive();
        println!("{:<20} {:>8} {:>10} {:>8}", "NODE", "ONLINE", "CONNECTED", "STORED");
        for n in &self.nodes {
            let stored = n
                .coordinator
                .store()
                .len()
                .map(|c| c.to_string())
                .unwrap_or_else(|_| "?".to_string());
            println!(
                "{:<20} {:>8} {:>10} {:>8}",
                n.name,
                n.node.is_online(),
                n.coordinator.connected().len(),
                stored
            );
        }
        let converged = self
            .nodes
            .iter()
            .filter(|n| n.node.is_online() && n.coordinator.connected().len() + 1 >= alive)
            .count();
        println!("\n{converged}/{alive} online nodes fully connected");
    }
}
