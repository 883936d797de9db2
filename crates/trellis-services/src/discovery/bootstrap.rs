//! Bootstrap exchange through a rendezvous board.
//!
//! When the identity of a single rendezvous peer is known out of band, that
//! peer keeps its current addresses on a shared board and joiners read the
//! board until it shows up. The board is anything both sides can reach: a
//! file on a shared volume in deployments, a `MemoryBoard` in tests.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use trellis_core::peer::PeerId;
use trellis_core::wire::Announcement;

use super::{Candidate, DiscoveryError};

pub trait RendezvousBoard: Send + Sync {
    /// Replace the board contents.
    fn publish(&self, announcement: &Announcement) -> Result<(), DiscoveryError>;

    /// Current contents. `Ok(None)` if nothing has been published yet.
    fn read(&self) -> Result<Option<Announcement>, DiscoveryError>;
}

// ── File board ────────────────────────────────────────────────────────────────

/// Board stored as a JSON announcement in a single file.
#[derive(Debug, Clone)]
pub struct FileBoard {
    path: PathBuf,
}

impl FileBoard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl RendezvousBoard for FileBoard {
    /// Atomic write: tmp file → rename, so readers never see a partial file.
    fn publish(&self, announcement: &Announcement) -> Result<(), DiscoveryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&announcement.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn read(&self) -> Result<Option<Announcement>, DiscoveryError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Announcement::decode(&bytes)?))
    }
}

// ── Memory board ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MemoryBoard {
    slot: Arc<Mutex<Option<Announcement>>>,
}

impl MemoryBoard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RendezvousBoard for MemoryBoard {
    fn publish(&self, announcement: &Announcement) -> Result<(), DiscoveryError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(announcement.clone());
        Ok(())
    }

    fn read(&self) -> Result<Option<Announcement>, DiscoveryError> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

// ── Exchange ──────────────────────────────────────────────────────────────────

pub struct BootstrapExchange {
    board: Arc<dyn RendezvousBoard>,
    target: PeerId,
    poll_interval: Duration,
    max_attempts: u32,
}

impl BootstrapExchange {
    pub fn new(
        board: Arc<dyn RendezvousBoard>,
        target: PeerId,
        poll_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            board,
            target,
            poll_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn target(&self) -> &PeerId {
        &self.target
    }

    pub fn is_rendezvous(&self, local: &PeerId) -> bool {
        &self.target == local
    }

    /// Rendezvous side: put our current addresses on the board.
    pub fn publish(&self, own: &Announcement) -> Result<(), DiscoveryError> {
        self.board.publish(own)
    }

    /// Joiner side: read the board until the rendezvous peer appears.
    ///
    /// An entry for another peer, a malformed board or an I/O error all
    /// count as "not there yet".
    pub async fn poll(&self) -> Result<Vec<Candidate>, DiscoveryError> {
        for attempt in 1..=self.max_attempts {
            match self.board.read() {
                Ok(Some(ann)) if ann.peer_id == self.target && !ann.addresses.is_empty() => {
                    tracing::debug!(
                        target_peer = %self.target.short(),
                        attempt,
                        addresses = ann.addresses.len(),
                        "rendezvous peer found on board"
                    );
                    return Ok(vec![Candidate::new(ann.peer_id, ann.addresses)]);
                }
                Ok(_) => {
                    tracing::trace!(attempt, "rendezvous peer not on board yet");
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "rendezvous board read failed");
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Err(DiscoveryError::NotPublished(
            self.target.clone(),
            self.max_attempts,
        ))
    }
}
