use crate::*;

use trellis_services::{FileBoard, MemoryBoard};

fn joiner_config(name: &str, target: &PeerId) -> TrellisConfig {
    let mut config = config(name);
    config.bootstrap.target = Some(target.to_string());
    config
}

async fn spawn_on_board(
    net: &MemoryNetwork,
    clock: &Arc<ManualClock>,
    name: &str,
    target: &PeerId,
    board: &Arc<dyn RendezvousBoard>,
) -> TestNode {
    let shared: SharedClock = clock.clone();
    let store = PeerStore::open_in_memory(shared).expect("in-memory store");
    spawn_with(
        net,
        clock,
        name,
        joiner_config(name, target),
        store,
        Some(board.clone()),
    )
    .await
}

// ══════════════════════════════════════════════════════════════════════════════
//  Bootstrap exchange
// ══════════════════════════════════════════════════════════════════════════════

/// Joiners find the rendezvous peer on the board, then find each other
/// through its peer list.
#[tokio::test(start_paused = true)]
async fn test_joiners_bootstrap_through_rendezvous() -> Result<()> {
    let net = MemoryNetwork::new();
    net.set_dht_available(false);
    let clock = ManualClock::shared(T0);
    let board: Arc<dyn RendezvousBoard> = Arc::new(MemoryBoard::new());
    let target = PeerId::derive(b"rv");

    let rv = spawn_on_board(&net, &clock, "rv", &target, &board).await;
    assert_eq!(rv.id(), target);
    let j1 = spawn_on_board(&net, &clock, "j1", &target, &board).await;
    let j2 = spawn_on_board(&net, &clock, "j2", &target, &board).await;

    wait_until("joiners to reach rendezvous", Duration::from_secs(10), || {
        j1.is_connected_to(&rv) && j2.is_connected_to(&rv)
    })
    .await?;
    wait_until("joiners to find each other", Duration::from_secs(60), || {
        fully_meshed(&[&rv, &j1, &j2])
    })
    .await?;

    // The rendezvous never dials anyone itself.
    assert_eq!(rv.node.dial_attempts(), 0);

    for n in [rv, j1, j2] {
        n.stop().await?;
    }
    Ok(())
}

/// A joiner that starts before the rendezvous peer gives up on the first
/// cycle and succeeds on a later one.
#[tokio::test(start_paused = true)]
async fn test_joiner_retries_until_rendezvous_appears() -> Result<()> {
    let net = MemoryNetwork::new();
    net.set_dht_available(false);
    let clock = ManualClock::shared(T0);
    let dir = tempfile::tempdir()?;
    let board: Arc<dyn RendezvousBoard> = Arc::new(FileBoard::new(dir.path().join("bootstrap.json")));
    let target = PeerId::derive(b"late-rv");

    let joiner = spawn_on_board(&net, &clock, "early", &target, &board).await;
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(board.read()?.is_none());

    let rv = spawn_on_board(&net, &clock, "late-rv", &target, &board).await;
    assert_eq!(board.read()?.map(|a| a.peer_id), Some(target.clone()));

    wait_until("joiner to reach late rendezvous", Duration::from_secs(60), || {
        joiner.is_connected_to(&rv)
    })
    .await?;

    joiner.stop().await?;
    rv.stop().await
}
