//! Durable peer store backed by SQLite.
//!
//! One `peers` table keyed by peer id. Addresses are a JSON array, most
//! recently confirmed first. `last_seen` is Unix ms, `created_at` Unix
//! seconds and written only on first insert.
//!
//! A single connection behind a mutex: every operation is atomic with
//! respect to every other, and durable once it returns. Operations block on
//! disk, so on a multi-threaded runtime they give up their worker thread
//! first (`block_in_place`).

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::runtime::{Handle, RuntimeFlavor};

use trellis_core::clock::SharedClock;
use trellis_core::peer::{dedup_addresses, PeerId, PeerRecord};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS peers (
        peer_id    TEXT PRIMARY KEY,
        addresses  TEXT NOT NULL,
        last_seen  INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_last_seen ON peers(last_seen);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("address encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("failed to create store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("refusing to store peer {0} with no addresses")]
    EmptyAddresses(PeerId),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct PeerStore {
    conn: Arc<Mutex<Connection>>,
    clock: SharedClock,
}

impl PeerStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>, clock: SharedClock) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "peer store opened");
        Self::with_connection(conn, clock)
    }

    /// A throwaway store for tests and degraded mode.
    pub fn open_in_memory(clock: SharedClock) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, clock)
    }

    fn with_connection(conn: Connection, clock: SharedClock) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> T) -> T {
        let run = move || f(&mut self.conn.lock().unwrap_or_else(|e| e.into_inner()));
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(run)
            }
            _ => run(),
        }
    }

    /// Insert or replace a peer's addresses and refresh `last_seen`.
    /// `created_at` is kept from the first insert.
    pub fn upsert(&self, peer_id: &PeerId, addresses: &[String]) -> Result<()> {
        let addresses = dedup_addresses(addresses);
        if addresses.is_empty() {
            return Err(StoreError::EmptyAddresses(peer_id.clone()));
        }
        let encoded = serde_json::to_string(&addresses)?;
        let now_ms = self.clock.now_ms();
        let now_secs = now_ms / 1000;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO peers (peer_id, addresses, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(peer_id) DO UPDATE SET
                     addresses = excluded.addresses,
                     last_seen = excluded.last_seen",
                params![peer_id.as_str(), encoded, now_ms as i64, now_secs as i64],
            )
        })?;
        tracing::trace!(peer = %peer_id, count = addresses.len(), "peer upserted");
        Ok(())
    }

    /// Refresh `last_seen` only. Returns false if the peer is unknown.
    pub fn touch(&self, peer_id: &PeerId) -> Result<bool> {
        let now_ms = self.clock.now_ms();
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE peers SET last_seen = ?1 WHERE peer_id = ?2",
                params![now_ms as i64, peer_id.as_str()],
            )
        })?;
        Ok(changed > 0)
    }

    pub fn get(&self, peer_id: &PeerId) -> Result<Option<PeerRecord>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT peer_id, addresses, last_seen, created_at FROM peers WHERE peer_id = ?1",
                params![peer_id.as_str()],
                RawRow::from_row,
            )
            .optional()
        })?;
        row.map(RawRow::into_record).transpose()
    }

    /// All records, most recently seen first. Rows with undecodable
    /// addresses are skipped.
    pub fn list(&self) -> Result<Vec<PeerRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT peer_id, addresses, last_seen, created_at FROM peers ORDER BY last_seen DESC",
            )?;
            let rows = stmt.query_map([], RawRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut records = Vec::new();
        for row in rows {
            match row.into_record() {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable peer row"),
            }
        }
        Ok(records)
    }

    pub fn list_ids(&self) -> Result<Vec<PeerId>> {
        let ids = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT peer_id FROM peers")?;
            let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;
            ids.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(ids.into_iter().map(PeerId::from).collect())
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM peers", [], |row| row.get(0))
        })?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove a peer. Returns whether it existed.
    pub fn delete(&self, peer_id: &PeerId) -> Result<bool> {
        let changed = self.with_conn(|conn| {
            conn.execute("DELETE FROM peers WHERE peer_id = ?1", params![peer_id.as_str()])
        })?;
        Ok(changed > 0)
    }

    /// Remove every record with `last_seen < now - age`.
    pub fn delete_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = self.clock.now_ms().saturating_sub(age.as_millis() as u64);
        let removed = self.with_conn(|conn| {
            conn.execute("DELETE FROM peers WHERE last_seen < ?1", params![cutoff as i64])
        })?;
        Ok(removed)
    }

    /// Remove every record whose id is not in `keep`. An empty set removes all.
    pub fn delete_except(&self, keep: &HashSet<PeerId>) -> Result<usize> {
        let removed = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let ids: Vec<String> = {
                let mut stmt = tx.prepare("SELECT peer_id FROM peers")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            let mut removed = 0;
            for id in ids {
                if keep.contains(&PeerId::from(id.as_str())) {
                    continue;
                }
                removed += tx.execute("DELETE FROM peers WHERE peer_id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok::<_, rusqlite::Error>(removed)
        })?;
        Ok(removed)
    }
}

/// Row as read from SQLite, before address decoding.
struct RawRow {
    peer_id: String,
    addresses: String,
    last_seen: i64,
    created_at: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            peer_id: row.get(0)?,
            addresses: row.get(1)?,
            last_seen: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn into_record(self) -> Result<PeerRecord> {
        Ok(PeerRecord {
            peer_id: PeerId::from(self.peer_id),
            addresses: serde_json::from_str(&self.addresses)?,
            last_seen: self.last_seen as u64,
            created_at: self.created_at as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::clock::ManualClock;

    const T0: u64 = 1_700_000_000_000;

    fn addrs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn store_at(start: u64) -> (PeerStore, Arc<ManualClock>) {
        let clock = ManualClock::shared(start);
        let store = PeerStore::open_in_memory(clock.clone()).expect("open");
        (store, clock)
    }

    #[test]
    fn upsert_then_get_on_empty_store() {
        let (store, _) = store_at(T0);
        let p1 = PeerId::new("P1");
        store.upsert(&p1, &addrs(&["/addr/1"])).unwrap();

        let record = store.get(&p1).unwrap().expect("present");
        assert_eq!(record.peer_id, p1);
        assert_eq!(record.addresses, addrs(&["/addr/1"]));
        assert_eq!(record.last_seen, T0);
        assert_eq!(record.created_at, T0 / 1000);
    }

    #[test]
    fn second_upsert_replaces_addresses_and_keeps_created_at() {
        let (store, clock) = store_at(T0);
        let p1 = PeerId::new("P1");
        store.upsert(&p1, &addrs(&["/a"])).unwrap();

        clock.advance(Duration::from_secs(90));
        store.upsert(&p1, &addrs(&["/a", "/b"])).unwrap();

        let record = store.get(&p1).unwrap().unwrap();
        assert_eq!(record.addresses, addrs(&["/a", "/b"]));
        assert_eq!(record.last_seen, T0 + 90_000);
        assert_eq!(record.created_at, T0 / 1000);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn upsert_rejects_empty_addresses() {
        let (store, _) = store_at(T0);
        let err = store.upsert(&PeerId::new("P1"), &[]).unwrap_err();
        assert!(matches!(err, StoreError::EmptyAddresses(_)));
        let err = store.upsert(&PeerId::new("P1"), &addrs(&[""])).unwrap_err();
        assert!(matches!(err, StoreError::EmptyAddresses(_)));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn upsert_dedups_addresses() {
        let (store, _) = store_at(T0);
        let p1 = PeerId::new("P1");
        store.upsert(&p1, &addrs(&["/a", "/b", "/a"])).unwrap();
        assert_eq!(store.get(&p1).unwrap().unwrap().addresses, addrs(&["/a", "/b"]));
    }

    #[test]
    fn get_unknown_is_none() {
        let (store, _) = store_at(T0);
        assert!(store.get(&PeerId::new("nobody")).unwrap().is_none());
    }

    #[test]
    fn delete_older_than_removes_only_stale() {
        let (store, clock) = store_at(T0);
        store.upsert(&PeerId::new("P1"), &addrs(&["/1"])).unwrap();
        clock.advance(Duration::from_secs(9 * 60));
        store.upsert(&PeerId::new("P2"), &addrs(&["/2"])).unwrap();
        clock.advance(Duration::from_secs(60));

        // P1 last seen 10 min ago, P2 1 min ago.
        let removed = store.delete_older_than(Duration::from_secs(5 * 60)).unwrap();
        assert_eq!(removed, 1);

        let remaining = store.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].peer_id, PeerId::new("P2"));
    }

    #[test]
    fn delete_older_than_keeps_boundary_record() {
        let (store, clock) = store_at(T0);
        store.upsert(&PeerId::new("P1"), &addrs(&["/1"])).unwrap();
        clock.advance(Duration::from_secs(300));
        assert_eq!(store.delete_older_than(Duration::from_secs(300)).unwrap(), 0);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn delete_except_keeps_only_listed_ids() {
        let (store, _) = store_at(T0);
        for id in ["P1", "P2", "P3"] {
            store.upsert(&PeerId::new(id), &addrs(&["/x"])).unwrap();
        }
        let before = store.get(&PeerId::new("P2")).unwrap();

        let keep: HashSet<PeerId> = [PeerId::new("P2")].into_iter().collect();
        assert_eq!(store.delete_except(&keep).unwrap(), 2);

        assert_eq!(store.list_ids().unwrap(), vec![PeerId::new("P2")]);
        assert_eq!(store.get(&PeerId::new("P2")).unwrap(), before);
    }

    #[test]
    fn delete_except_empty_set_clears_store() {
        let (store, _) = store_at(T0);
        store.upsert(&PeerId::new("P1"), &addrs(&["/x"])).unwrap();
        assert_eq!(store.delete_except(&HashSet::new()).unwrap(), 1);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn list_orders_by_last_seen_descending() {
        let (store, clock) = store_at(T0);
        for id in ["old", "mid", "new"] {
            store.upsert(&PeerId::new(id), &addrs(&["/x"])).unwrap();
            clock.advance(Duration::from_secs(1));
        }
        let ids: Vec<_> = store.list().unwrap().into_iter().map(|r| r.peer_id).collect();
        assert_eq!(ids, vec![PeerId::new("new"), PeerId::new("mid"), PeerId::new("old")]);
    }

    #[test]
    fn delete_and_touch() {
        let (store, clock) = store_at(T0);
        let p1 = PeerId::new("P1");
        store.upsert(&p1, &addrs(&["/x"])).unwrap();

        clock.advance(Duration::from_secs(5));
        assert!(store.touch(&p1).unwrap());
        assert_eq!(store.get(&p1).unwrap().unwrap().last_seen, T0 + 5_000);

        assert!(store.delete(&p1).unwrap());
        assert!(!store.delete(&p1).unwrap());
        assert!(!store.touch(&p1).unwrap());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peer-db-test.db");
        let clock = ManualClock::shared(T0);
        {
            let store = PeerStore::open(&path, clock.clone()).unwrap();
            store.upsert(&PeerId::new("P1"), &addrs(&["/a", "/b"])).unwrap();
        }
        let store = PeerStore::open(&path, clock).unwrap();
        let record = store.get(&PeerId::new("P1")).unwrap().unwrap();
        assert_eq!(record.addresses, addrs(&["/a", "/b"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn usable_from_multi_thread_runtime_tasks() {
        let (store, _) = store_at(T0);
        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.upsert(&PeerId::new(format!("P{i}")), &addrs(&["/x"])).unwrap();
                    store.list_ids().unwrap().len()
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap() >= 1);
        }
        assert_eq!(store.len().unwrap(), 4);
    }

    #[test]
    fn concurrent_upserts_do_not_duplicate() {
        let (store, _) = store_at(T0);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..20 {
                        let id = PeerId::new(format!("P{}", j % 5));
                        store.upsert(&id, &[format!("/t{i}/{j}")]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len().unwrap(), 5);
    }
}
