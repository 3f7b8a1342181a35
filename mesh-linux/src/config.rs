//! Load config from file and environment.

use anyhow::Context;
use mesh_core::{DiscoveryMode, MeshConfig};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;

/// How long the daemon keeps discovering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Once,
    Forever,
}

impl From<Mode> for DiscoveryMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::Once => DiscoveryMode::Once,
            Mode::Forever => DiscoveryMode::Forever,
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Mode::Once),
            "forever" => Ok(Mode::Forever),
            other => Err(format!("unknown mode {other:?}")),
        }
    }
}

/// Daemon configuration. File: ~/.config/meshlink/config.toml or /etc/meshlink/config.toml.
/// Env overrides: MESHLINK_DISCOVERY_PORT, MESHLINK_TRANSPORT_PORT, MESHLINK_CHANNELS,
/// MESHLINK_MODE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Run against in-process simulated peers instead of the LAN.
    #[serde(default)]
    pub simulate: bool,
    #[serde(default)]
    pub mesh: MeshConfig,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_mode() -> Mode {
    Mode::Forever
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            mode: default_mode(),
            simulate: false,
            mesh: MeshConfig::default(),
        }
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match load_file()? {
        Some(c) => c,
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c.mesh.validate().context("invalid [mesh] config")?;
    Ok(c)
}

/// Apply overrides from `lookup`. Unparseable values are ignored with a warning.
pub fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
        let value = value?;
        let out = value.parse().ok();
        if out.is_none() {
            warn!(key, value = %value, "ignoring unparseable override");
        }
        out
    }
    if let Some(p) = parsed("MESHLINK_DISCOVERY_PORT", lookup("MESHLINK_DISCOVERY_PORT")) {
        c.discovery_port = p;
    }
    if let Some(p) = parsed("MESHLINK_TRANSPORT_PORT", lookup("MESHLINK_TRANSPORT_PORT")) {
        c.transport_port = p;
    }
    if let Some(n) = parsed("MESHLINK_CHANNELS", lookup("MESHLINK_CHANNELS")) {
        c.mesh.channels = n;
    }
    if let Some(m) = parsed("MESHLINK_MODE", lookup("MESHLINK_MODE")) {
        c.mode = m;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshlink/config.toml"));
    out
}

fn load_file() -> anyhow::Result<Option<Config>> {
    for p in config_paths() {
        if p.exists() {
            let s = std::fs::read_to_string(&p)
                .with_context(|| format!("reading {}", p.display()))?;
            let c = parse(&s).with_context(|| format!("parsing {}", p.display()))?;
            return Ok(Some(c));
        }
    }
    Ok(None)
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}
