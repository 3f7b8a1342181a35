use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mesh_core::commitment::{CommitmentError, Salt, Sealed};
use mesh_core::memory::{MemoryNetwork, RecordingBootstrap};
use mesh_core::radio::{channel_characteristic, CHANNEL_SELECT};
use mesh_core::{
    encode, Capability, ChannelAllocator, Connection, DiscoveryMode, LocalIdentity, MeshConfig,
    Packet, PeerRegistry, PoolError, Radio, SessionContext, SessionError, SessionOutcome,
    SessionPool, StageEngine, StageId,
};
use uuid::Uuid;

const BOTH: [Capability; 2] = [Capability::WifiDirect, Capability::Ble];

fn device(
    net: &MemoryNetwork,
    name: &str,
    preference: &[Capability],
) -> (SessionPool, Arc<RecordingBootstrap>) {
    let bootstrap = Arc::new(RecordingBootstrap::new(BOTH));
    let pool = SessionPool::builder(Arc::new(net.radio(name)), bootstrap.clone())
        .config(MeshConfig {
            capabilities: preference.to_vec(),
            discovery_timeout_ms: 5_000,
            ..MeshConfig::default()
        })
        .build()
        .unwrap();
    (pool, bootstrap)
}

fn context(identity: LocalIdentity) -> SessionContext {
    SessionContext {
        identity: Arc::new(identity),
        registry: Arc::new(PeerRegistry::new()),
        allocator: ChannelAllocator::new(4),
        bootstrap: Arc::new(RecordingBootstrap::new(BOTH)),
        config: Arc::new(MeshConfig::default()),
    }
}

async fn link(net: &MemoryNetwork, from: &str, to: &str) -> (Connection, Connection) {
    let a = net.radio(from);
    let b = net.radio(to);
    let ab = a.connect(&to.into()).await.unwrap();
    let ba = b.connect(&from.into()).await.unwrap();
    (ab, ba)
}

/// A hand-driven peer: announces channel 7 and sends a committed id, then a
/// reveal of `revealed`, then goes quiet.
async fn scripted_peer(conn: &Connection, committed: Uuid, revealed: Uuid) {
    let salt = Salt::random();
    let channel = channel_characteristic(7);
    conn.serve(CHANNEL_SELECT, vec![7]).await.unwrap();
    let hashed = Packet::Luid(Sealed::hashed(&committed, &salt));
    let reveal = Packet::Luid(Sealed::Revealed {
        value: revealed,
        salt,
    });
    conn.notify(channel, encode(&hashed).unwrap()).await.unwrap();
    conn.notify(channel, encode(&reveal).unwrap()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn two_pools_complete_one_handshake_each() {
    let net = MemoryNetwork::new();
    let (a, a_boot) = device(&net, "a", &BOTH);
    let (b, b_boot) = device(&net, "b", &BOTH);
    let mut a_results = Box::pin(a.results());
    let mut b_results = Box::pin(b.results());
    let a_discovery = a.discover(DiscoveryMode::Once);
    let b_discovery = b.discover(DiscoveryMode::Once);

    assert!(a_results.next().await.unwrap().unwrap().is_success());
    assert!(b_results.next().await.unwrap().unwrap().is_success());
    a_discovery.await.unwrap();
    b_discovery.await.unwrap();

    let (ha, hb) = (a_boot.handoffs(), b_boot.handoffs());
    assert_eq!((ha.len(), hb.len()), (1, 1));
    assert_eq!(ha[0].capability, Capability::WifiDirect);
    assert_eq!(hb[0].capability, Capability::WifiDirect);
    assert_ne!(ha[0].role, hb[0].role);
    assert_eq!(ha[0].metadata, hb[0].metadata);

    for pool in [&a, &b] {
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.allocator().outstanding(), 0);
        assert!(pool.registry().is_empty());
        assert!(pool.identity().rotations() >= 1);
    }
    assert_eq!(net.open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn split_vote_is_settled_by_tiebreak_on_both_sides() {
    let net = MemoryNetwork::new();
    let (a, a_boot) = device(&net, "a", &[Capability::WifiDirect, Capability::Ble]);
    let (b, b_boot) = device(&net, "b", &[Capability::Ble, Capability::WifiDirect]);
    let mut a_results = Box::pin(a.results());
    let mut b_results = Box::pin(b.results());
    a.discover(DiscoveryMode::Once);
    b.discover(DiscoveryMode::Once);

    assert!(a_results.next().await.unwrap().unwrap().is_success());
    assert!(b_results.next().await.unwrap().unwrap().is_success());
    let (ha, hb) = (a_boot.handoffs(), b_boot.handoffs());
    assert_eq!(ha[0].capability, hb[0].capability);
    assert!(ha[0].capability.is_valid());
    assert_ne!(ha[0].role, hb[0].role);
}

#[tokio::test(start_paused = true)]
async fn second_session_with_same_peer_id_exits_at_luid() {
    let net = MemoryNetwork::new();
    let shared = Uuid::new_v4();
    let (x_to_y1, y1) = link(&net, "x", "y1").await;
    let (x_to_y2, y2) = link(&net, "x", "y2").await;
    let x = context(LocalIdentity::new());
    let engine = StageEngine::new(Duration::from_secs(10));

    // y1 reveals `shared` and then stalls, so its session with x stays registered.
    scripted_peer(&y1, shared, shared).await;
    let first = {
        let (engine, ctx) = (engine, x.clone());
        tokio::spawn(async move { engine.start(x_to_y1, ctx).await })
    };
    while !x.registry.contains(&shared) {
        tokio::task::yield_now().await;
    }

    let y2_ctx = context(LocalIdentity::with_luid(shared));
    let (second, y2_report) = tokio::join!(
        engine.start(x_to_y2, x.clone()),
        engine.start(y2, y2_ctx)
    );
    assert!(matches!(second.outcome, SessionOutcome::Duplicate));
    assert_eq!(
        second.history,
        vec![StageId::LuidHashed, StageId::Luid, StageId::Exit]
    );
    assert!(matches!(y2_report.outcome, SessionOutcome::Failure(_)));

    let first = first.await.unwrap();
    assert!(matches!(
        first.outcome,
        SessionOutcome::Failure(SessionError::Timeout(StageId::Advertise))
    ));
    assert!(x.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_sessions_with_one_peer_id_let_exactly_one_through() {
    let net = MemoryNetwork::new();
    let shared = Uuid::new_v4();
    let (x_to_y1, y1) = link(&net, "x", "y1").await;
    let (x_to_y2, y2) = link(&net, "x", "y2").await;
    let x = context(LocalIdentity::new());
    let engine = StageEngine::new(Duration::from_secs(10));

    let (x1, x2, r1, r2) = tokio::join!(
        engine.start(x_to_y1, x.clone()),
        engine.start(x_to_y2, x.clone()),
        engine.start(y1, context(LocalIdentity::with_luid(shared))),
        engine.start(y2, context(LocalIdentity::with_luid(shared))),
    );
    let (winner, loser, winner_peer) = match (&x1.outcome, &x2.outcome) {
        (SessionOutcome::Success(_), SessionOutcome::Duplicate) => (&x1, &x2, &r1),
        (SessionOutcome::Duplicate, SessionOutcome::Success(_)) => (&x2, &x1, &r2),
        other => panic!("expected one success and one duplicate, got {other:?}"),
    };
    assert_eq!(winner.history, StageId::SEQUENCE.to_vec());
    assert_eq!(
        loser.history,
        vec![StageId::LuidHashed, StageId::Luid, StageId::Exit]
    );
    assert!(winner_peer.outcome.is_success());
    assert!(x.registry.is_empty());
    assert_eq!(x.allocator.outstanding(), 0);
}

#[tokio::test]
async fn tampered_reveal_fails_closed() {
    let net = MemoryNetwork::new();
    let (x_to_y, y) = link(&net, "x", "y").await;
    let x = context(LocalIdentity::new());
    scripted_peer(&y, Uuid::new_v4(), Uuid::new_v4()).await;

    let report = StageEngine::new(Duration::from_secs(10))
        .start(x_to_y, x.clone())
        .await;
    assert!(matches!(
        report.outcome,
        SessionOutcome::Failure(SessionError::Commitment(CommitmentError::HashMismatch))
    ));
    assert_eq!(
        report.history,
        vec![StageId::LuidHashed, StageId::Luid, StageId::Exit]
    );
    assert!(x.registry.is_empty());
    assert_eq!(x.allocator.outstanding(), 0);
    assert!(!y.is_connected());
}

#[tokio::test(start_paused = true)]
async fn leaked_channels_surface_as_starvation() {
    let net = MemoryNetwork::new();
    let pool = SessionPool::builder(
        Arc::new(net.radio("a")),
        Arc::new(RecordingBootstrap::new(BOTH)),
    )
    .config(MeshConfig {
        channels: 1,
        lease_timeout_ms: 1_000,
        ..MeshConfig::default()
    })
    .build()
    .unwrap();
    net.radio("b");
    std::mem::forget(pool.allocator().try_acquire().unwrap());

    let mut results = Box::pin(pool.results());
    pool.open_session("b".into()).unwrap().await.unwrap();
    match results.next().await.unwrap() {
        Err(PoolError::AllocatorStarved(bound)) => assert_eq!(bound, Duration::from_secs(1)),
        other => panic!("expected starvation, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stop_ends_forever_discovery() {
    let net = MemoryNetwork::new();
    let (pool, _) = device(&net, "a", &BOTH);
    let discovery = pool.discover(DiscoveryMode::Forever);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!discovery.is_finished());
    pool.stop();
    discovery.await.unwrap();
}
