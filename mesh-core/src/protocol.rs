//! Meshlink handshake protocol: packet types, capabilities and version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commitment::Sealed;

/// Current protocol version. Carried in the advertise packet.
pub const PROTOCOL_VERSION: u8 = 1;

/// Key/value metadata attached to an upgrade (e.g. group name and passphrase).
pub type Metadata = BTreeMap<String, String>;

/// Upgrade transport a device can offer. Wire codes are stable; unknown codes
/// decode as `Invalid` so a newer peer never breaks an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Capability {
    /// Stay on the short-range radio for bulk transfer.
    Ble,
    /// Form a Wi-Fi Direct group.
    WifiDirect,
    Invalid,
}

impl Capability {
    pub const fn code(self) -> u8 {
        match self {
            Capability::Ble => 0,
            Capability::WifiDirect => 1,
            Capability::Invalid => 255,
        }
    }

    pub fn is_valid(self) -> bool {
        self != Capability::Invalid
    }
}

impl From<u8> for Capability {
    fn from(code: u8) -> Self {
        match code {
            0 => Capability::Ble,
            1 => Capability::WifiDirect,
            _ => Capability::Invalid,
        }
    }
}

impl From<Capability> for u8 {
    fn from(c: Capability) -> u8 {
        c.code()
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::Ble => "ble",
            Capability::WifiDirect => "wifi-direct",
            Capability::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Capability {
    type Err = UnknownCapability;

    /// Parses the names printed by `Display`. `invalid` is not accepted; it is
    /// never a meaningful thing to configure.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ble" => Ok(Capability::Ble),
            "wifi-direct" => Ok(Capability::WifiDirect),
            other => Err(UnknownCapability(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability {0:?} (expected \"ble\" or \"wifi-direct\")")]
pub struct UnknownCapability(pub String);

/// Outcome of the leader election for one device in one session.
/// The initiator emits the bootstrap descriptor; the responder receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// The committed part of an election ballot (the salt travels alongside).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElectionVote {
    pub tiebreaker: Uuid,
    pub capability: Capability,
}

/// All handshake packets. Encoding is bincode; framing is length + CRC (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Ephemeral id, hashed during `LuidHashed` and revealed during `Luid`.
    Luid(Sealed<Uuid>),
    /// Capabilities this device can upgrade to.
    Advertise {
        protocol_version: u8,
        capabilities: Vec<Capability>,
    },
    /// Election ballot, hashed during `ElectionHashed` and revealed during `Election`.
    Election(Sealed<ElectionVote>),
    /// Sent by the elected initiator: which transport to bootstrap and how.
    Upgrade {
        capability: Capability,
        metadata: Metadata,
    },
}

impl Packet {
    /// Short name for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Luid(s) if s.is_hashed() => "luid-hashed",
            Packet::Luid(_) => "luid",
            Packet::Advertise { .. } => "advertise",
            Packet::Election(s) if s.is_hashed() => "election-hashed",
            Packet::Election(_) => "election",
            Packet::Upgrade { .. } => "upgrade",
        }
    }
}
