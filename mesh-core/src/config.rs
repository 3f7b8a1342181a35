//! Engine configuration. Embedded in the daemon's config file as `[mesh]`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::Capability;

/// Names in config files (`"wifi-direct"`, `"ble"`) rather than wire codes.
mod capability_names {
    use crate::protocol::Capability;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[Capability], serializer: S) -> Result<S::Ok, S::Error> {
        v.iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Capability>, D::Error> {
        let names: Vec<String> = Deserialize::deserialize(d)?;
        names
            .iter()
            .map(|n| n.parse::<Capability>().map_err(serde::de::Error::custom))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    /// Notification channels shared by concurrent sessions (default 4).
    #[serde(default = "default_channels")]
    pub channels: u8,
    /// Upper bound on one handshake stage (default 10 s).
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// How long a session waits for a channel before the pool reports starvation (default 60 s).
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
    /// Length of a `Once` discovery run (default 30 s).
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Pause between scan passes (default 2 s).
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Upgrade transports in preference order.
    #[serde(default = "default_capabilities", with = "capability_names")]
    pub capabilities: Vec<Capability>,
    /// Results buffered per observer before the slowest one starts missing them.
    #[serde(default = "default_results_capacity")]
    pub results_capacity: usize,
}

fn default_channels() -> u8 {
    4
}
fn default_stage_timeout_ms() -> u64 {
    10_000
}
fn default_lease_timeout_ms() -> u64 {
    60_000
}
fn default_discovery_timeout_ms() -> u64 {
    30_000
}
fn default_scan_interval_ms() -> u64 {
    2_000
}
fn default_capabilities() -> Vec<Capability> {
    vec![Capability::WifiDirect, Capability::Ble]
}
fn default_results_capacity() -> usize {
    64
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            stage_timeout_ms: default_stage_timeout_ms(),
            lease_timeout_ms: default_lease_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            scan_interval_ms: default_scan_interval_ms(),
            capabilities: default_capabilities(),
            results_capacity: default_results_capacity(),
        }
    }
}

impl MeshConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels == 0 {
            return Err(ConfigError::NoChannels);
        }
        if self.results_capacity == 0 {
            return Err(ConfigError::ZeroField("results_capacity"));
        }
        for (name, ms) in [
            ("stage_timeout_ms", self.stage_timeout_ms),
            ("lease_timeout_ms", self.lease_timeout_ms),
            ("scan_interval_ms", self.scan_interval_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::ZeroField(name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one channel is required")]
    NoChannels,
    #[error("{0} must be greater than zero")]
    ZeroField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = MeshConfig::default();
        assert_eq!(c.channels, 4);
        assert_eq!(c.stage_timeout(), Duration::from_secs(10));
        assert_eq!(c.capabilities, vec![Capability::WifiDirect, Capability::Ble]);
        assert_eq!(c.validate(), Ok(()));
    }

    #[test]
    fn zero_channels_rejected() {
        let c = MeshConfig {
            channels: 0,
            ..MeshConfig::default()
        };
        assert_eq!(c.validate(), Err(ConfigError::NoChannels));
    }

    #[test]
    fn zero_timeout_rejected() {
        let c = MeshConfig {
            stage_timeout_ms: 0,
            ..MeshConfig::default()
        };
        assert_eq!(c.validate(), Err(ConfigError::ZeroField("stage_timeout_ms")));
    }

    fn parse_names(names: &[&str]) -> Result<Vec<Capability>, serde::de::value::Error> {
        use serde::de::IntoDeserializer;
        let owned: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        capability_names::deserialize(owned.into_deserializer())
    }

    #[test]
    fn capability_names_parse_in_order() {
        assert_eq!(
            parse_names(&["ble", "wifi-direct"]).unwrap(),
            vec![Capability::Ble, Capability::WifiDirect]
        );
    }

    #[test]
    fn unknown_capability_name_rejected() {
        let err = parse_names(&["ble", "lora"]).unwrap_err();
        assert!(err.to_string().contains("lora"));
    }
}
