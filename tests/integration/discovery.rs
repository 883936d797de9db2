use crate::*;

use trellis_core::wire::DHT_ANNOUNCE_KEY;

// ══════════════════════════════════════════════════════════════════════════════
//  Gossip peer-list exchange
// ══════════════════════════════════════════════════════════════════════════════

/// A, B and C in a line (A-B, B-C). With the DHT unreachable, A can only learn about C
/// from B's peer list.
#[tokio::test(start_paused = true)]
async fn test_gossip_makes_two_hop_peer_dialable() -> Result<()> {
    let net = MemoryNetwork::new();
    net.set_dht_available(false);
    let clock = ManualClock::shared(T0);

    let a = spawn_node(&net, &clock, "a").await;
    let b = spawn_node(&net, &clock, "b").await;
    let c = spawn_node(&net, &clock, "c").await;
    link(&a, &b).await?;
    link(&b, &c).await?;

    wait_until("a and c to connect", Duration::from_secs(60), || {
        a.is_connected_to(&c) && c.is_connected_to(&a)
    })
    .await?;
    assert!(fully_meshed(&[&a, &b, &c]));

    // C reached A's store through gossip, with C's real listen address.
    let record = a
        .coordinator
        .store()
        .get(&c.id())?
        .context("c missing from a's store")?;
    assert_eq!(record.addresses[0], c.address());

    for n in [a, b, c] {
        n.stop().await?;
    }
    Ok(())
}

/// A lone node hears only its own peer lists and must never dial.
#[tokio::test(start_paused = true)]
async fn test_own_gossip_never_dials() -> Result<()> {
    let net = MemoryNetwork::new();
    let clock = ManualClock::shared(T0);
    let solo = spawn_node(&net, &clock, "solo").await;

    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(solo.node.dial_attempts(), 0);
    assert!(solo.coordinator.store().is_empty()?);
    solo.stop().await
}

// ══════════════════════════════════════════════════════════════════════════════
//  DHT announce/query
// ══════════════════════════════════════════════════════════════════════════════

/// No seed connections at all: everyone finds everyone through the shared
/// DHT key within a couple of announce cycles.
#[tokio::test(start_paused = true)]
async fn test_dht_discovers_unconnected_peers() -> Result<()> {
    let net = MemoryNetwork::new();
    let clock = ManualClock::shared(T0);

    let nodes = vec![
        spawn_node(&net, &clock, "d0").await,
        spawn_node(&net, &clock, "d1").await,
        spawn_node(&net, &clock, "d2").await,
        spawn_node(&net, &clock, "d3").await,
    ];
    let refs: Vec<&TestNode> = nodes.iter().collect();

    wait_until("dht mesh", Duration::from_secs(90), || fully_meshed(&refs)).await?;
    assert_eq!(net.dht_len(DHT_ANNOUNCE_KEY), 4);

    for n in &nodes {
        assert_eq!(n.coordinator.store().len()?, 3, "{} store size", n.name);
    }
    for n in nodes {
        n.stop().await?;
    }
    Ok(())
}

/// An identical announcement read over and over leads to one dial and one
/// store row.
#[tokio::test(start_paused = true)]
async fn test_repeated_announcements_are_idempotent() -> Result<()> {
    let net = MemoryNetwork::new();
    let clock = ManualClock::shared(T0);
    let a = spawn_node(&net, &clock, "a").await;
    let b = spawn_node(&net, &clock, "b").await;

    wait_until("a and b to connect", Duration::from_secs(60), || {
        a.is_connected_to(&b)
    })
    .await?;
    let dials = a.node.dial_attempts() + b.node.dial_attempts();

    // Several more DHT and gossip cycles.
    tokio::time::sleep(Duration::from_secs(180)).await;

    assert_eq!(a.node.dial_attempts() + b.node.dial_attempts(), dials);
    assert_eq!(a.coordinator.store().list_ids()?, vec![b.id()]);
    assert_eq!(b.coordinator.store().list_ids()?, vec![a.id()]);

    a.stop().await?;
    b.stop().await
}
