// Peer discovery and messaging: UDP LAN discovery, TCP chat envelopes with
// ranked fallback delivery, and world chat over an HTTP relay.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod events;
pub mod messaging;
pub mod peers;
pub mod registry;
pub mod relay;
pub mod shutdown;
pub mod store;

pub use config::EngineConfig;
pub use engine::Engine;
pub use events::{EngineEvent, EventBus, EventStream, Sender};
pub use peers::{rank_candidates, Candidate, PeerRecord, PeerRegistry};
pub use registry::{RegistryActor, RegistryHandle};
pub use relay::{WorldInbox, WorldSettings};
pub use store::{parse_peer_spec, ManualPeer, ManualPeerStore, WorldSettingsStore};
