//! Handoff from a finished handshake to the bulk transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::{Capability, Metadata, Role};

/// Metadata keys a Wi-Fi Direct handoff must carry.
pub const WIFI_DIRECT_KEYS: [&str; 2] = ["name", "passphrase"];

/// Everything the bulk transport needs to take over the pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapDescriptor {
    pub capability: Capability,
    pub role: Role,
    pub metadata: Metadata,
}

/// Build the descriptor for an elected outcome, checking that the metadata the
/// capability needs is present.
pub fn dispatch(
    capability: Capability,
    role: Role,
    metadata: Metadata,
) -> Result<BootstrapDescriptor, BootstrapError> {
    let required: &[&str] = match capability {
        Capability::Invalid => return Err(BootstrapError::Unsupported(capability)),
        Capability::Ble => &[],
        Capability::WifiDirect => &WIFI_DIRECT_KEYS,
    };
    if let Some(key) = required.iter().find(|k| !metadata.contains_key(**k)) {
        return Err(BootstrapError::MissingMetadata {
            capability,
            key: (*key).to_string(),
        });
    }
    Ok(BootstrapDescriptor {
        capability,
        role,
        metadata,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStatus {
    Success,
    Fail,
}

/// Terminal payload reported for each peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub identities_transferred: u64,
    pub messages_transferred: u64,
    pub status: HandshakeStatus,
}

impl HandshakeResult {
    pub fn success() -> Self {
        Self {
            identities_transferred: 0,
            messages_transferred: 0,
            status: HandshakeStatus::Success,
        }
    }

    pub fn fail() -> Self {
        Self {
            status: HandshakeStatus::Fail,
            ..Self::success()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == HandshakeStatus::Success
    }
}

/// The bulk-transport collaborator.
#[async_trait]
pub trait BootstrapTarget: Send + Sync + 'static {
    /// Whether this device can bring up `capability` at all.
    fn supports(&self, capability: Capability) -> bool;

    /// Initiator side: set up the transport and return what the responder
    /// needs to join it (e.g. group name and passphrase).
    async fn prepare(&self, capability: Capability) -> Result<Metadata, BootstrapError>;

    /// Take over the pairing described by `descriptor`.
    async fn bootstrap(&self, descriptor: BootstrapDescriptor) -> HandshakeResult;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("no bootstrap for capability {0}")]
    Unsupported(Capability),
    #[error("{capability} bootstrap needs metadata key {key:?}")]
    MissingMetadata { capability: Capability, key: String },
    #[error("bootstrap target failed: {0}")]
    Target(String),
}
