//! Radio interface consumed by the core: discovery, connections and
//! characteristic operations. Implemented by the daemon's LAN adapter and by
//! [`crate::memory`] for tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Opaque address of a radio peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        PeerAddress(s.to_string())
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        PeerAddress(s)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A readable or notifiable slot on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Characteristic(pub Uuid);

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

const CHARACTERISTIC_BASE: u128 = 0x8c5e_0000_3a1d_4f0b_9e62_7d14_c0a8_0000;

/// Each side serves its leased channel id here so the peer knows where to listen.
pub const CHANNEL_SELECT: Characteristic =
    Characteristic(Uuid::from_u128(CHARACTERISTIC_BASE | 0x1_0000_0000));

/// Characteristic for channel `id`.
pub const fn channel_characteristic(id: u8) -> Characteristic {
    Characteristic(Uuid::from_u128(CHARACTERISTIC_BASE | id as u128))
}

/// Notifications arriving on one characteristic. Ends when the link closes.
pub type Notifications = BoxStream<'static, Vec<u8>>;

/// A live link to one physical peer. Role-agnostic: both ends run a session
/// over their own endpoint.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    fn address(&self) -> &PeerAddress;

    fn is_connected(&self) -> bool;

    /// Push `bytes` to the peer on `characteristic`.
    async fn notify(&self, characteristic: Characteristic, bytes: Vec<u8>)
        -> Result<(), RadioError>;

    /// Subscribe to the peer's notifications on `characteristic`. One subscriber
    /// per characteristic per connection.
    async fn await_notification(
        &self,
        characteristic: Characteristic,
    ) -> Result<Notifications, RadioError>;

    /// Read the value the peer serves on `characteristic`, waiting until it does.
    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, RadioError>;

    /// Answer the peer's reads of `characteristic` with `value`.
    async fn serve(&self, characteristic: Characteristic, value: Vec<u8>)
        -> Result<(), RadioError>;

    /// Close the link. Idempotent; pending reads and subscriptions end.
    async fn disconnect(&self);
}

pub type Connection = Arc<dyn PeerConnection>;

#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// This device's own address.
    fn local_address(&self) -> &PeerAddress;

    /// One scan pass. The stream ends when the pass is over.
    async fn scan(&self) -> Result<BoxStream<'static, PeerAddress>, RadioError>;

    async fn connect(&self, peer: &PeerAddress) -> Result<Connection, RadioError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RadioError {
    #[error("link disconnected")]
    Disconnected,
    #[error("connect to {0} failed: {1}")]
    ConnectFailed(PeerAddress, String),
    #[error("no peer at {0}")]
    NotFound(PeerAddress),
    #[error("characteristic {0} already has a subscriber")]
    AlreadySubscribed(Characteristic),
    #[error("notification queue for {0} is full")]
    Overflow(Characteristic),
    #[error("io: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for RadioError {
    fn from(e: std::io::Error) -> Self {
        RadioError::Io(Arc::new(e))
    }
}

/// Notifications held per characteristic until the subscriber takes them.
pub const MAILBOX_CAPACITY: usize = 64;

/// Queue of notifications on one characteristic of one connection. Frames that
/// arrive before anyone subscribes wait here; the one subscriber takes the
/// receiving half. Once closed, queued frames still drain and the stream ends.
pub struct Mailbox {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl Mailbox {
    /// A mailbox on a link that is already closed starts closed.
    pub fn new(open: bool) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        Mailbox {
            tx: open.then_some(tx),
            rx: Some(rx),
        }
    }

    pub fn push(&self, characteristic: Characteristic, bytes: Vec<u8>) -> Result<(), RadioError> {
        let tx = self.tx.as_ref().ok_or(RadioError::Disconnected)?;
        tx.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => RadioError::Overflow(characteristic),
            TrySendError::Closed(_) => RadioError::Disconnected,
        })
    }

    pub fn subscribe(
        &mut self,
        characteristic: Characteristic,
    ) -> Result<Notifications, RadioError> {
        let rx = self
            .rx
            .take()
            .ok_or(RadioError::AlreadySubscribed(characteristic))?;
        Ok(ReceiverStream::new(rx).boxed())
    }

    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// At most one live connection per peer address. The lock is never held across
/// a connect.
#[derive(Default)]
pub struct ConnectionCache {
    live: Mutex<HashMap<PeerAddress, Connection>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<PeerAddress, Connection>> {
        self.live.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn cached(&self, peer: &PeerAddress) -> Option<Connection> {
        let mut live = self.live();
        match live.get(peer) {
            Some(conn) if conn.is_connected() => Some(Arc::clone(conn)),
            Some(_) => {
                live.remove(peer);
                None
            }
            None => None,
        }
    }

    /// Cached connection to `peer`, or a new one from `radio`.
    pub async fn get_or_connect(
        &self,
        radio: &dyn Radio,
        peer: &PeerAddress,
    ) -> Result<Connection, RadioError> {
        if let Some(conn) = self.cached(peer) {
            return Ok(conn);
        }
        let fresh = radio.connect(peer).await?;
        let raced = {
            let mut live = self.live();
            match live.get(peer) {
                Some(existing) if existing.is_connected() => Some(Arc::clone(existing)),
                _ => {
                    live.insert(peer.clone(), Arc::clone(&fresh));
                    None
                }
            }
        };
        match raced {
            Some(existing) if !Arc::ptr_eq(&existing, &fresh) => {
                fresh.disconnect().await;
                Ok(existing)
            }
            Some(existing) => Ok(existing),
            None => Ok(fresh),
        }
    }

    /// Forget `peer`'s connection. The caller decides whether to disconnect it.
    pub fn evict(&self, peer: &PeerAddress) -> Option<Connection> {
        self.live().remove(peer)
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peers: Vec<PeerAddress> = self.live().keys().cloned().collect();
        f.debug_struct("ConnectionCache").field("peers", &peers).finish()
    }
}
