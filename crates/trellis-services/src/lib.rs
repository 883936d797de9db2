//! trellis-services: the peer directory and the loops that keep it healthy.
//!
//! `Coordinator` wires the connection tracker, address cache, durable store,
//! discovery strategies and reconciliation jobs around a `Substrate`.

pub mod cache;
pub mod coordinator;
pub mod discovery;
pub mod memory;
pub mod scheduler;
pub mod store;
pub mod tracker;

pub use cache::AddressCache;
pub use coordinator::{Coordinator, DialState};
pub use discovery::{
    BootstrapExchange, Candidate, DhtDiscovery, DiscoveryError, FileBoard, GossipPeerList,
    MemoryBoard, RendezvousBoard, Source,
};
pub use memory::{MemoryNetwork, MemoryNode};
pub use scheduler::{PersistReport, PruneReport, Reconciler, Stats};
pub use store::{PeerStore, StoreError};
pub use tracker::{resolve_addresses, AddressSource, ConnectionTracker, RetryPolicy};
