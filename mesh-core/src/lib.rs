//! Meshlink handshake core.
//! Radio-agnostic: the host supplies a [`Radio`] and a [`BootstrapTarget`];
//! the core runs the staged handshake and leader election with every peer.

pub mod allocator;
pub mod bootstrap;
pub mod commitment;
pub mod config;
pub mod election;
pub mod engine;
pub mod identity;
pub mod memory;
pub mod pool;
pub mod protocol;
pub mod radio;
pub mod session;
pub mod stage;
pub mod wakelock;
pub mod wire;

pub use allocator::{AllocatorError, ChannelAllocator, ChannelLease};
pub use bootstrap::{
    BootstrapDescriptor, BootstrapError, BootstrapTarget, HandshakeResult, HandshakeStatus,
};
pub use config::{ConfigError, MeshConfig};
pub use engine::{SessionReport, StageEngine};
pub use identity::{LocalIdentity, PeerRegistry};
pub use pool::{DiscoveryMode, PoolError, PoolEvent, SessionPool};
pub use protocol::{Capability, Metadata, Packet, Role, PROTOCOL_VERSION};
pub use radio::{Characteristic, Connection, PeerAddress, PeerConnection, Radio, RadioError};
pub use session::{SessionContext, SessionError, SessionOutcome};
pub use stage::StageId;
pub use wakelock::{NoopWakeLock, WakeLock};
pub use wire::{decode, decode_frame, encode, DecodeError, EncodeError};
