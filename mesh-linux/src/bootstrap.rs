//! Bootstrap target for hosts without a Wi-Fi Direct stack: invents group
//! credentials and logs each handoff.

use async_trait::async_trait;
use mesh_core::{
    BootstrapDescriptor, BootstrapError, BootstrapTarget, Capability, HandshakeResult, Metadata,
};
use tracing::info;
use uuid::Uuid;

pub struct LoggingBootstrap {
    supported: Vec<Capability>,
}

impl LoggingBootstrap {
    pub fn new(supported: Vec<Capability>) -> Self {
        Self { supported }
    }
}

#[async_trait]
impl BootstrapTarget for LoggingBootstrap {
    fn supports(&self, capability: Capability) -> bool {
        self.supported.contains(&capability)
    }

    async fn prepare(&self, capability: Capability) -> Result<Metadata, BootstrapError> {
        match capability {
            Capability::WifiDirect if self.supports(capability) => {
                let token = Uuid::new_v4().simple().to_string();
                let mut m = Metadata::new();
                m.insert("name".into(), format!("DIRECT-ml-{}", &token[..8]));
                m.insert("passphrase".into(), token[8..24].to_string());
                Ok(m)
            }
            Capability::Ble if self.supports(capability) => Ok(Metadata::new()),
            other => Err(BootstrapError::Unsupported(other)),
        }
    }

    async fn bootstrap(&self, descriptor: BootstrapDescriptor) -> HandshakeResult {
        info!(
            capability = %descriptor.capability,
            role = ?descriptor.role,
            group = descriptor.metadata.get("name").map(String::as_str).unwrap_or("-"),
            "handoff"
        );
        HandshakeResult::success()
    }
}
