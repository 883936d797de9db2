//! trellis-core: peer types, wire formats, configuration and the substrate
//! contract. All other Trellis crates depend on this one.

pub mod clock;
pub mod config;
pub mod peer;
pub mod substrate;
pub mod wire;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::TrellisConfig;
pub use peer::{PeerId, PeerRecord};
pub use substrate::{GossipMessage, PeerEvent, Substrate, SubstrateError};
pub use wire::{Announcement, PeerList, PeerListEntry, WireError};
