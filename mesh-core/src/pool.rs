//! Session pool: discovery, one session per peer connection, and the merged
//! result stream.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::allocator::{AllocatorError, ChannelAllocator};
use crate::bootstrap::{BootstrapTarget, HandshakeResult};
use crate::config::{ConfigError, MeshConfig};
use crate::engine::{SessionReport, StageEngine};
use crate::identity::{LocalIdentity, PeerRegistry};
use crate::radio::{ConnectionCache, PeerAddress, Radio, RadioError};
use crate::session::{SessionContext, SessionError, SessionOutcome};
use crate::wakelock::{NoopWakeLock, WakeGate, WakeLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Scan until the discovery timeout, starting at most one session per peer.
    Once,
    /// Scan until stopped.
    Forever,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("no channel freed within {0:?}; a lease has likely leaked")]
    AllocatorStarved(Duration),
    #[error("scan failed: {0}")]
    Scan(RadioError),
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
}

/// One item of the result stream.
pub type PoolEvent = Result<HandshakeResult, PoolError>;

pub struct SessionPoolBuilder {
    radio: Arc<dyn Radio>,
    bootstrap: Arc<dyn BootstrapTarget>,
    config: MeshConfig,
    identity: Option<Arc<LocalIdentity>>,
    wake_lock: Option<Arc<dyn WakeLock>>,
}

impl SessionPoolBuilder {
    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an identity with something else on the device (default: fresh).
    pub fn identity(mut self, identity: Arc<LocalIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn wake_lock(mut self, lock: Arc<dyn WakeLock>) -> Self {
        self.wake_lock = Some(lock);
        self
    }

    pub fn build(self) -> Result<SessionPool, PoolError> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let ctx = SessionContext {
            identity: self.identity.unwrap_or_default(),
            registry: Arc::new(PeerRegistry::new()),
            allocator: ChannelAllocator::new(config.channels),
            bootstrap: Arc::clone(&self.bootstrap),
            config: Arc::clone(&config),
        };
        let wake_lock = self.wake_lock.unwrap_or_else(|| Arc::new(NoopWakeLock));
        let (results, _) = broadcast::channel(config.results_capacity);
        let (stop, _) = watch::channel(false);
        Ok(SessionPool {
            inner: Arc::new(PoolInner {
                radio: self.radio,
                bootstrap: self.bootstrap,
                engine: StageEngine::new(config.stage_timeout()),
                ctx,
                cache: ConnectionCache::new(),
                wake: WakeGate::new(wake_lock),
                active: Mutex::new(HashSet::new()),
                results,
                stop,
            }),
        })
    }
}

struct PoolInner {
    radio: Arc<dyn Radio>,
    bootstrap: Arc<dyn BootstrapTarget>,
    engine: StageEngine,
    ctx: SessionContext,
    cache: ConnectionCache,
    wake: Arc<WakeGate>,
    active: Mutex<HashSet<PeerAddress>>,
    results: broadcast::Sender<PoolEvent>,
    stop: watch::Sender<bool>,
}

impl PoolInner {
    fn active(&self) -> MutexGuard<'_, HashSet<PeerAddress>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: PoolEvent) {
        // No observers is fine; the event is simply dropped.
        let _ = self.results.send(event);
    }

    async fn run_session(&self, peer: &PeerAddress) -> Option<PoolEvent> {
        let conn = match self.cache.get_or_connect(self.radio.as_ref(), peer).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%peer, error = %e, "connect failed");
                return Some(Ok(HandshakeResult::fail()));
            }
        };
        let session: JoinHandle<SessionReport> = {
            let (engine, ctx, conn) = (self.engine, self.ctx.clone(), conn.clone());
            tokio::spawn(async move { engine.start(conn, ctx).await })
        };
        let report = session.await;
        self.cache.evict(peer);
        conn.disconnect().await;

        let report = match report {
            Ok(report) => report,
            Err(e) => {
                error!(%peer, error = %e, "session task died");
                return Some(Ok(HandshakeResult::fail()));
            }
        };
        match report.outcome {
            SessionOutcome::Success(descriptor) => {
                Some(Ok(self.bootstrap.bootstrap(descriptor).await))
            }
            SessionOutcome::Duplicate => None,
            SessionOutcome::Failure(SessionError::Allocator(AllocatorError::Starved(bound))) => {
                error!(%peer, ?bound, "channel allocator starved");
                Some(Err(PoolError::AllocatorStarved(bound)))
            }
            SessionOutcome::Failure(_) => Some(Ok(HandshakeResult::fail())),
        }
    }
}

/// Keeps a peer in the active set for the life of its session.
struct ActiveGuard {
    pool: Arc<PoolInner>,
    peer: PeerAddress,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.pool.active().remove(&self.peer);
    }
}

/// Discovers peers and runs a handshake with each. Cheap to clone.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn builder(
        radio: Arc<dyn Radio>,
        bootstrap: Arc<dyn BootstrapTarget>,
    ) -> SessionPoolBuilder {
        SessionPoolBuilder {
            radio,
            bootstrap,
            config: MeshConfig::default(),
            identity: None,
            wake_lock: None,
        }
    }

    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.inner.ctx.identity
    }

    pub fn allocator(&self) -> &Arc<ChannelAllocator> {
        &self.inner.ctx.allocator
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.inner.ctx.registry
    }

    /// Sessions currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.wake.in_flight()
    }

    /// Terminal results from now on. Each call is an independent observer; one
    /// that falls more than `results_capacity` behind misses the oldest items.
    pub fn results(&self) -> impl Stream<Item = PoolEvent> + Send + 'static {
        BroadcastStream::new(self.inner.results.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(missed, "result observer lagged");
                None
            }
        })
    }

    /// Start a session with `peer` unless one is already running.
    pub fn open_session(&self, peer: PeerAddress) -> Option<JoinHandle<()>> {
        if !self.inner.active().insert(peer.clone()) {
            debug!(%peer, "session already in flight");
            return None;
        }
        let guard = ActiveGuard {
            pool: Arc::clone(&self.inner),
            peer,
        };
        let in_flight = self.inner.wake.enter();
        Some(tokio::spawn(async move {
            let pool = Arc::clone(&guard.pool);
            if let Some(event) = pool.run_session(&guard.peer).await {
                pool.emit(event);
            }
            drop(in_flight);
            drop(guard);
        }))
    }

    /// Scan and open sessions until `mode` says to stop or [`stop`](Self::stop)
    /// is called. Sessions already running are unaffected by either.
    pub fn discover(&self, mode: DiscoveryMode) -> JoinHandle<()> {
        self.inner.stop.send_replace(false);
        let pool = self.clone();
        tokio::spawn(async move { pool.discovery_loop(mode).await })
    }

    async fn discovery_loop(&self, mode: DiscoveryMode) {
        let config = Arc::clone(&self.inner.ctx.config);
        let mut stop = self.inner.stop.subscribe();
        info!(?mode, "discovery started");

        let mut seen: HashSet<PeerAddress> = HashSet::new();
        let scanning = async {
            loop {
                match self.inner.radio.scan().await {
                    Ok(mut peers) => {
                        while let Some(peer) = peers.next().await {
                            if mode == DiscoveryMode::Once && !seen.insert(peer.clone()) {
                                continue;
                            }
                            self.open_session(peer);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "scan failed");
                        self.inner.emit(Err(PoolError::Scan(e)));
                    }
                }
                tokio::time::sleep(config.scan_interval()).await;
            }
        };
        let limit = async {
            match mode {
                DiscoveryMode::Once => tokio::time::sleep(config.discovery_timeout()).await,
                DiscoveryMode::Forever => std::future::pending().await,
            }
        };
        let stopped = async {
            loop {
                let stopped = *stop.borrow_and_update();
                if stopped || stop.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            _ = scanning => {}
            _ = limit => debug!("discovery timeout"),
            _ = stopped => debug!("discovery stopped"),
        }
        info!(?mode, "discovery ended");
    }

    /// End discovery. Sessions in flight run to completion.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
    }

    /// End discovery and refuse new channel leases; waiting sessions fail.
    pub fn shutdown(&self) {
        self.stop();
        self.inner.ctx.allocator.close();
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("local", self.inner.radio.local_address())
            .field("in_flight", &self.in_flight())
            .field("connections", &self.inner.cache)
            .finish_non_exhaustive()
    }
}
