//! LAN discovery: UDP multicast beacon, parse beacons/responses, maintain peer list.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mesh_core::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MULTICAST_GROUP: &str = "239.255.60.60";
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Announcement {
    Beacon {
        protocol_version: u8,
        node: Uuid,
        listen_port: u16,
    },
    Response {
        protocol_version: u8,
        node: Uuid,
        listen_port: u16,
    },
}

#[derive(Debug, Clone, Copy)]
struct PeerState {
    addr: SocketAddr,
    last_seen: Instant,
}

/// Nodes heard on the LAN, keyed by node id, with the address of their link
/// listener.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: Arc<Mutex<HashMap<Uuid, PeerState>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PeerState>> {
        self.peers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record a sighting. Returns true if the node was not known.
    pub fn saw(&self, node: Uuid, addr: SocketAddr, now: Instant) -> bool {
        self.lock()
            .insert(
                node,
                PeerState {
                    addr,
                    last_seen: now,
                },
            )
            .is_none()
    }

    pub fn addr_of(&self, node: &Uuid) -> Option<SocketAddr> {
        self.lock().get(node).map(|s| s.addr)
    }

    pub fn nodes(&self) -> Vec<Uuid> {
        let mut nodes: Vec<Uuid> = self.lock().keys().copied().collect();
        nodes.sort();
        nodes
    }

    /// Drop nodes not heard from within `PEER_TIMEOUT` of `now`.
    pub fn expire(&self, now: Instant) -> Vec<Uuid> {
        let mut p = self.lock();
        let gone: Vec<Uuid> = p
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) >= PEER_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in &gone {
            p.remove(id);
        }
        gone
    }
}

/// Fold one datagram into `peers`. Returns true if the sender should get a
/// response (a beacon from another node).
pub fn handle_datagram(peers: &PeerTable, me: Uuid, from: SocketAddr, buf: &[u8]) -> bool {
    let Ok(msg) = bincode::deserialize::<Announcement>(buf) else {
        return false;
    };
    let (protocol_version, node, listen_port, is_beacon) = match msg {
        Announcement::Beacon {
            protocol_version,
            node,
            listen_port,
        } => (protocol_version, node, listen_port, true),
        Announcement::Response {
            protocol_version,
            node,
            listen_port,
        } => (protocol_version, node, listen_port, false),
    };
    if protocol_version != PROTOCOL_VERSION || node == me {
        return false;
    }
    if peers.saw(node, SocketAddr::new(from.ip(), listen_port), Instant::now()) {
        info!(%node, %from, "peer joined");
    }
    is_beacon
}

pub async fn run_discovery(
    me: Uuid,
    peers: PeerTable,
    discovery_port: u16,
    transport_port: u16,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port).await?);

    let beacon_task = tokio::spawn(beacon_loop(
        socket.clone(),
        me,
        discovery_port,
        transport_port,
    ));
    let recv_task = tokio::spawn(recv_loop(socket, peers.clone(), me, transport_port));
    let timeout_task = tokio::spawn(peer_timeout_loop(peers));

    let (beacon, recv, _) = tokio::try_join!(beacon_task, recv_task, timeout_task)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    beacon?;
    recv
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
    let multicast: std::net::Ipv4Addr =
        MULTICAST_GROUP
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
            })?;
    std_sock.join_multicast_v4(&multicast, &std::net::Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn encode(msg: &Announcement) -> std::io::Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    me: Uuid,
    discovery_port: u16,
    transport_port: u16,
) -> std::io::Result<()> {
    let frame = encode(&Announcement::Beacon {
        protocol_version: PROTOCOL_VERSION,
        node: me,
        listen_port: transport_port,
    })?;
    let dest: SocketAddr = format!("{}:{}", MULTICAST_GROUP, discovery_port)
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    peers: PeerTable,
    me: Uuid,
    transport_port: u16,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 2048];
    let response = encode(&Announcement::Response {
        protocol_version: PROTOCOL_VERSION,
        node: me,
        listen_port: transport_port,
    })?;
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if handle_datagram(&peers, me, from, &buf[..n]) {
            if let Err(e) = socket.send_to(&response, from).await {
                warn!(%from, error = %e, "discovery response failed");
            }
        }
    }
}

async fn peer_timeout_loop(peers: PeerTable) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        for node in peers.expire(Instant::now()) {
            info!(%node, "peer left");
        }
    }
}
