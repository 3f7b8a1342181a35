//! Drives one [`Session`] through every stage to `Exit`.

use std::time::Duration;

use tracing::{debug, info, info_span, Instrument};

use crate::bootstrap::BootstrapDescriptor;
use crate::protocol::Capability;
use crate::radio::Connection;
use crate::session::{Session, SessionContext, SessionError, SessionOutcome};
use crate::stage::StageId;

/// Terminal outcome plus the stages the session went through.
#[derive(Debug)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub history: Vec<StageId>,
}

#[derive(Debug, Clone, Copy)]
pub struct StageEngine {
    stage_timeout: Duration,
}

impl StageEngine {
    pub fn new(stage_timeout: Duration) -> Self {
        Self { stage_timeout }
    }

    /// Run a full handshake over `conn`. The session, and with it the lease,
    /// the peer registration and the identity rotation, is dropped before this
    /// returns. A session that doesn't succeed disconnects the link so the
    /// peer stops waiting.
    pub async fn start(&self, conn: Connection, ctx: SessionContext) -> SessionReport {
        let span = info_span!("session", peer = %conn.address());
        self.run(conn, ctx).instrument(span).await
    }

    async fn run(&self, conn: Connection, ctx: SessionContext) -> SessionReport {
        let (result, history) = match Session::establish(conn.clone(), ctx).await {
            Ok(mut session) => {
                let result = self.drive(&mut session).await;
                (result, session.history().to_vec())
            }
            Err(e) => (Err(e), Vec::new()),
        };
        let outcome = SessionOutcome::from_result(result);
        if !outcome.is_success() {
            conn.disconnect().await;
        }
        match &outcome {
            SessionOutcome::Success(d) => {
                info!(capability = %d.capability, role = ?d.role, "handshake complete")
            }
            SessionOutcome::Duplicate => info!("peer already in session, dropping"),
            SessionOutcome::Failure(e) => info!(error = %e, "handshake failed"),
        }
        SessionReport { outcome, history }
    }

    async fn drive(&self, session: &mut Session) -> Result<BootstrapDescriptor, SessionError> {
        loop {
            let stage = session.stage();
            debug!(%stage, "entering stage");
            let step = tokio::time::timeout(self.stage_timeout, session.step())
                .await
                .unwrap_or(Err(SessionError::Timeout(stage)));
            match step {
                Ok(Some(descriptor)) => return Ok(descriptor),
                Ok(None) if session.stage().is_terminal() => {
                    return Err(SessionError::UnsupportedCapability(Capability::Invalid))
                }
                Ok(None) => {}
                Err(e) => {
                    session.report_failure(&e);
                    session.abort();
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::allocator::ChannelAllocator;
    use crate::config::MeshConfig;
    use crate::identity::{LocalIdentity, PeerRegistry};
    use crate::memory::{MemoryNetwork, RecordingBootstrap};
    use crate::protocol::{Capability, Role};
    use crate::radio::{Radio, CHANNEL_SELECT};

    fn context(supported: &[Capability]) -> SessionContext {
        SessionContext {
            identity: Arc::new(LocalIdentity::new()),
            registry: Arc::new(PeerRegistry::new()),
            allocator: ChannelAllocator::new(2),
            bootstrap: Arc::new(RecordingBootstrap::new(supported.iter().copied())),
            config: Arc::new(MeshConfig::default()),
        }
    }

    async fn handshake(
        a_caps: &[Capability],
        b_caps: &[Capability],
    ) -> (SessionReport, SessionReport) {
        let net = MemoryNetwork::new();
        let a = net.radio("a");
        let b = net.radio("b");
        let ab = a.connect(&"b".into()).await.unwrap();
        let ba = b.connect(&"a".into()).await.unwrap();
        let engine = StageEngine::new(Duration::from_secs(5));
        let (ctx_a, ctx_b) = (context(a_caps), context(b_caps));
        tokio::join!(engine.start(ab, ctx_a), engine.start(ba, ctx_b))
    }

    #[tokio::test]
    async fn two_devices_agree_on_capability_and_split_roles() {
        let both = [Capability::WifiDirect, Capability::Ble];
        let (ra, rb) = handshake(&both, &both).await;
        let (SessionOutcome::Success(da), SessionOutcome::Success(db)) = (ra.outcome, rb.outcome)
        else {
            panic!("both sides should succeed");
        };
        assert_eq!(da.capability, Capability::WifiDirect);
        assert_eq!(db.capability, Capability::WifiDirect);
        assert_ne!(da.role, db.role);
        let responder = if da.role == Role::Responder { &da } else { &db };
        assert_eq!(responder.metadata["name"], "DIRECT-meshlink");
        assert_eq!(ra.history, StageId::SEQUENCE.to_vec());
        assert_eq!(rb.history, StageId::SEQUENCE.to_vec());
    }

    #[tokio::test]
    async fn falls_back_to_capability_both_support() {
        let (ra, rb) = handshake(
            &[Capability::WifiDirect, Capability::Ble],
            &[Capability::Ble],
        )
        .await;
        for report in [ra, rb] {
            match report.outcome {
                SessionOutcome::Success(d) => assert_eq!(d.capability, Capability::Ble),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn no_common_capability_fails_both_sides() {
        let (ra, rb) = handshake(&[Capability::WifiDirect], &[Capability::Ble]).await;
        for report in [ra, rb] {
            assert!(matches!(
                report.outcome,
                SessionOutcome::Failure(SessionError::UnsupportedCapability(_))
            ));
            assert_eq!(report.history.last(), Some(&StageId::Exit));
            assert!(!report.history.contains(&StageId::Upgrade));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_first_stage() {
        let net = MemoryNetwork::new();
        let a = net.radio("a");
        let b = net.radio("b");
        let ab = a.connect(&"b".into()).await.unwrap();
        let ba = b.connect(&"a".into()).await.unwrap();
        ba.serve(CHANNEL_SELECT, vec![0]).await.unwrap();
        let ctx = context(&[Capability::Ble]);
        let report = StageEngine::new(Duration::from_secs(10))
            .start(ab, ctx.clone())
            .await;
        assert!(matches!(
            report.outcome,
            SessionOutcome::Failure(SessionError::Timeout(StageId::LuidHashed))
        ));
        assert_eq!(report.history, vec![StageId::LuidHashed, StageId::Exit]);
        assert_eq!(ctx.allocator.outstanding(), 0);
        assert!(!ba.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn absent_peer_times_out_channel_select() {
        let net = MemoryNetwork::new();
        let a = net.radio("a");
        net.radio("b");
        let ab = a.connect(&"b".into()).await.unwrap();
        let report = StageEngine::new(Duration::from_secs(10))
            .start(ab, context(&[Capability::Ble]))
            .await;
        assert!(matches!(
            report.outcome,
            SessionOutcome::Failure(SessionError::ChannelSelectTimeout)
        ));
        assert!(report.history.is_empty());
    }
}
