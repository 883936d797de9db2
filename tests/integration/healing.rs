use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Pruning
// ══════════════════════════════════════════════════════════════════════════════

/// A peer that leaves stays in the store through the retention window and
/// is pruned once it ages out.
#[tokio::test(start_paused = true)]
async fn test_departed_peer_is_pruned() -> Result<()> {
    let net = MemoryNetwork::new();
    let clock = ManualClock::shared(T0);
    let a = spawn_node(&net, &clock, "a").await;
    let b = spawn_node(&net, &clock, "b").await;
    let b_id = b.id();

    wait_until("a and b to connect", Duration::from_secs(60), || {
        a.is_connected_to(&b)
    })
    .await?;
    b.stop().await?;
    wait_until("a to notice b left", Duration::from_secs(5), || {
        !a.coordinator.tracker().contains(&b_id)
    })
    .await?;

    // Within retention: kept.
    clock.advance(Duration::from_secs(2 * 60));
    let report = a.coordinator.reconciler().prune()?;
    assert_eq!(report.stale_removed, 0);
    assert!(a.coordinator.store().get(&b_id)?.is_some());

    // Past retention and past the announcement TTL, so the DHT no longer
    // refreshes it either. The scheduled prune job removes it.
    clock.advance(Duration::from_secs(10 * 60));
    wait_until("b to be pruned", Duration::from_secs(60), || {
        matches!(a.coordinator.store().get(&b_id), Ok(None))
    })
    .await?;
    assert!(a.coordinator.store().is_empty()?);

    // Still cached: the cache lives until restart.
    assert!(a.coordinator.cache().contains(&b_id));
    a.stop().await
}

/// A connected peer survives pruning no matter how long ago it was first
/// recorded, as long as the periodic persist keeps refreshing it.
#[tokio::test(start_paused = true)]
async fn test_connected_peer_survives_pruning() -> Result<()> {
    let net = MemoryNetwork::new();
    let clock = ManualClock::shared(T0);
    let a = spawn_node(&net, &clock, "a").await;
    let b = spawn_node(&net, &clock, "b").await;

    wait_until("a and b to connect", Duration::from_secs(60), || {
        a.is_connected_to(&b)
    })
    .await?;

    for _ in 0..6 {
        clock.advance(Duration::from_secs(4 * 60));
        tokio::time::sleep(Duration::from_secs(31)).await;
    }
    assert!(a.coordinator.store().get(&b.id())?.is_some());
    assert!(a.is_connected_to(&b));

    a.stop().await?;
    b.stop().await
}

// ══════════════════════════════════════════════════════════════════════════════
//  Restart
// ══════════════════════════════════════════════════════════════════════════════

/// A restarted node reconnects to peers it knew before the restart from its
/// store alone, with no DHT and no bootstrap.
#[tokio::test(start_paused = true)]
async fn test_restart_reconnects_from_store() -> Result<()> {
    let net = MemoryNetwork::new();
    net.set_dht_available(false);
    let clock = ManualClock::shared(T0);
    let dir = tempfile::tempdir()?;

    let a = spawn_with(&net, &clock, "a", config("a"), file_store(dir.path(), "a", &clock)?, None).await;
    let b = spawn_node(&net, &clock, "b").await;
    link(&a, &b).await?;
    wait_until("a to persist b", Duration::from_secs(30), || {
        matches!(a.coordinator.store().get(&b.id()), Ok(Some(_)))
    })
    .await?;
    a.stop().await?;

    let dials_before = b.node.dial_attempts();
    let a = spawn_with(&net, &clock, "a", config("a"), file_store(dir.path(), "a", &clock)?, None).await;
    wait_until("restarted a to reach b", Duration::from_secs(5), || {
        a.is_connected_to(&b) && b.is_connected_to(&a)
    })
    .await?;

    // The restarted node did the dialing, from its store.
    assert_eq!(a.node.dial_attempts(), 1);
    assert_eq!(b.node.dial_attempts(), dials_before);

    a.stop().await?;
    b.stop().await
}
