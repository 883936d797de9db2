//! trellisd: runs a cluster of Trellis nodes in one process.
//!
//! Every node gets its own coordinator and peer store on disk; node 0 is the
//! bootstrap rendezvous and publishes to a shared board file. Useful for
//! watching the directory converge and heal after a node is killed.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use trellis_core::config::{data_dir, TrellisConfig};

mod sim;

use sim::Simulation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Topology {
    /// No seed connections; everything goes through discovery.
    None,
    /// Each node dials the next two, plus one random earlier node.
    Ring,
}

#[derive(Parser, Debug)]
#[command(name = "trellisd")]
#[command(about = "In-process Trellis peer directory simulation")]
struct Args {
    /// Number of nodes to start
    #[arg(short, long, default_value_t = 5)]
    nodes: usize,

    /// Stop after this many seconds (runs until Ctrl-C if omitted)
    #[arg(short, long)]
    duration: Option<u64>,

    /// Directory for peer stores and the bootstrap board
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seed connections made before discovery starts
    #[arg(long, value_enum, default_value_t = Topology::None)]
    topology: Topology,

    /// Shut this node down partway through the run
    #[arg(long)]
    kill: Option<usize>,

    /// Seconds after start at which `--kill` takes effect
    #[arg(long, default_value_t = 20)]
    kill_after: u64,

    /// Delay before a node learns a new peer's listen address
    #[arg(long, default_value_t = 0)]
    address_book_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.nodes >= 1, "need at least one node");
    if let Some(k) = args.kill {
        anyhow::ensure!(k < args.nodes, "--kill {k} is out of range for {} nodes", args.nodes);
    }

    if let Err(e) = TrellisConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TrellisConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TrellisConfig::default()
    });

    let root = args.data_dir.clone().unwrap_or_else(|| data_dir().join("sim"));
    std::fs::create_dir_all(&root)
        .with_context(|| format!("failed to create {}", root.display()))?;
    tracing::info!(nodes = args.nodes, root = %root.display(), "trellisd starting");

    let mut sim = Simulation::start(
        &config,
        &root,
        args.nodes,
        Duration::from_millis(args.address_book_delay_ms),
    )
    .context("failed to start simulation")?;

    if args.topology == Topology::Ring {
        sim.seed_ring().await;
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let shutdown = sim.shutdown_handle();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }
    if let Some(secs) = args.duration {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            tracing::info!(secs, "run duration elapsed");
            let _ = shutdown.send(());
        });
    }
    if let Some(index) = args.kill {
        let victim = sim.node(index);
        let delay = Duration::from_secs(args.kill_after);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(node) = victim {
                tracing::info!(index, "killing node");
                node.shutdown();
            }
        });
    }

    // ── Progress ─────────────────────────────────────────────────────────────
    let mut rx = shutdown.subscribe();
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = rx.recv() => break,
            _ = interval.tick() => sim.log_progress(),
        }
    }

    sim.stop().await;
    sim.print_summary();
    Ok(())
}
