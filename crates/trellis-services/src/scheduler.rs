//! Reconciliation jobs: keep the durable store in line with reality.
//!
//! Three independent periodic jobs. Each is idempotent and safe to run
//! concurrently with the others and with discovery:
//!
//! - persist-connected: refresh every live connection in cache and store
//! - prune: drop records that are neither connected nor recently seen
//! - stats: log store size and connection count

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use trellis_core::clock::SharedClock;
use trellis_core::config::ReconciliationConfig;
use trellis_core::peer::PeerId;
use trellis_core::substrate::Substrate;

use crate::cache::AddressCache;
use crate::store::{PeerStore, StoreError};
use crate::tracker::ConnectionTracker;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistReport {
    pub connections: usize,
    pub persisted: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub kept: usize,
    /// Neither connected nor seen within the retention window.
    pub stale_removed: usize,
    /// Past the absolute age ceiling.
    pub expired_removed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// None when the store could not be read.
    pub stored: Option<usize>,
    pub connected: usize,
    pub cached: usize,
}

pub struct Reconciler<S: Substrate + ?Sized> {
    substrate: Arc<S>,
    store: PeerStore,
    cache: AddressCache,
    tracker: ConnectionTracker,
    clock: SharedClock,
    retention: Duration,
    max_age: Duration,
}

impl<S: Substrate + ?Sized> Reconciler<S> {
    pub fn new(
        substrate: Arc<S>,
        store: PeerStore,
        cache: AddressCache,
        tracker: ConnectionTracker,
        clock: SharedClock,
        config: &ReconciliationConfig,
    ) -> Self {
        Self {
            substrate,
            store,
            cache,
            tracker,
            clock,
            retention: config.retention(),
            max_age: config.max_age(),
        }
    }

    /// Merge each live connection's remote address into the cache and
    /// upsert the store, refreshing `last_seen`.
    pub fn persist_connected(&self) -> PersistReport {
        let connections = self.substrate.connections();
        let mut report = PersistReport {
            connections: connections.len(),
            ..Default::default()
        };

        for (peer, remote) in connections {
            let fresh: Vec<String> = if remote.is_empty() { Vec::new() } else { vec![remote] };
            let merged = self.cache.merge(peer.clone(), &fresh);
            if merged.is_empty() {
                continue;
            }
            match self.store.upsert(&peer, &merged) {
                Ok(()) => report.persisted += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(peer = %peer.short(), error = %e, "failed to persist connected peer");
                }
            }
        }

        tracing::debug!(
            connections = report.connections,
            persisted = report.persisted,
            failed = report.failed,
            "persist-connected complete"
        );
        report
    }

    /// Keep connected peers and recently seen records; drop everything
    /// else, then drop anything past the age ceiling regardless.
    pub fn prune(&self) -> Result<PruneReport, StoreError> {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(self.retention.as_millis() as u64);

        let mut keep: HashSet<PeerId> = self.tracker.snapshot().into_iter().collect();
        keep.extend(
            self.store
                .list()?
                .into_iter()
                .filter(|r| r.last_seen >= cutoff)
                .map(|r| r.peer_id),
        );

        let stale_removed = self.store.delete_except(&keep)?;
        let expired_removed = self.store.delete_older_than(self.max_age)?;
        let report = PruneReport {
            kept: keep.len(),
            stale_removed,
            expired_removed,
        };

        if stale_removed > 0 || expired_removed > 0 {
            tracing::info!(
                stale = stale_removed,
                expired = expired_removed,
                "pruned peer store"
            );
        }
        Ok(report)
    }

    /// Read-only snapshot of directory size.
    pub fn stats(&self) -> Stats {
        let stored = match self.store.len() {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(error = %e, "failed to count stored peers");
                None
            }
        };
        let stats = Stats {
            stored,
            connected: self.tracker.len(),
            cached: self.cache.len(),
        };
        tracing::info!(
            stored = ?stats.stored,
            connected = stats.connected,
            cached = stats.cached,
            "peer directory stats"
        );
        stats
    }
}

/// Run `job` every `period` until shutdown. The first run is one period
/// after start.
pub async fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let period = period.max(Duration::from_millis(1));
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(job = name, "periodic job stopping");
                return;
            }
            _ = interval.tick() => job().await,
        }
    }
}
