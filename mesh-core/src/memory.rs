//! In-process radio and bootstrap target. Every radio created from one
//! [`MemoryNetwork`] can see and connect to every other one.
//!
//! A link between two radios is shared: whichever side connects first creates
//! it and the other side's `connect` returns the matching endpoint. Once either
//! side disconnects, the next `connect` creates a fresh link.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;

use crate::bootstrap::{BootstrapDescriptor, BootstrapError, BootstrapTarget, HandshakeResult};
use crate::protocol::{Capability, Metadata};
use crate::radio::{
    Characteristic, Connection, Mailbox, Notifications, PeerAddress, PeerConnection, Radio,
    RadioError,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Default)]
struct NetworkState {
    radios: BTreeSet<PeerAddress>,
    links: HashMap<(PeerAddress, PeerAddress), [Arc<MemoryConnection>; 2]>,
}

/// Shared medium for a set of [`MemoryRadio`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a radio named `address` on the network.
    pub fn radio(&self, address: &str) -> MemoryRadio {
        let address = PeerAddress::from(address);
        lock(&self.state).radios.insert(address.clone());
        MemoryRadio {
            address,
            network: self.clone(),
        }
    }

    /// Links currently open.
    pub fn open_links(&self) -> usize {
        lock(&self.state).links.len()
    }

    fn connect(&self, from: &PeerAddress, to: &PeerAddress) -> Result<Connection, RadioError> {
        if from == to {
            return Err(RadioError::ConnectFailed(to.clone(), "self".into()));
        }
        let mut state = lock(&self.state);
        if !state.radios.contains(to) {
            return Err(RadioError::NotFound(to.clone()));
        }
        let key = link_key(from, to);
        if let Some(ends) = state.links.get(&key) {
            if ends[0].is_connected() {
                let ours = ends.iter().find(|end| &end.local == from);
                if let Some(end) = ours {
                    return Ok(Arc::clone(end) as Connection);
                }
            }
        }
        let link = Arc::new(Link::default());
        let lo = Arc::new(MemoryConnection {
            local: key.0.clone(),
            remote: key.1.clone(),
            link: Arc::clone(&link),
            forward: true,
            network: Arc::downgrade(&self.state),
        });
        let hi = Arc::new(MemoryConnection {
            local: key.1.clone(),
            remote: key.0.clone(),
            link,
            forward: false,
            network: Arc::downgrade(&self.state),
        });
        let ours = if &lo.local == from {
            Arc::clone(&lo) as Connection
        } else {
            Arc::clone(&hi) as Connection
        };
        state.links.insert(key, [lo, hi]);
        Ok(ours)
    }

    fn forget(&self, conn: &MemoryConnection) {
        let key = link_key(&conn.local, &conn.remote);
        let mut state = lock(&self.state);
        let same = state
            .links
            .get(&key)
            .is_some_and(|ends| Arc::ptr_eq(&ends[0].link, &conn.link));
        if same {
            state.links.remove(&key);
        }
    }
}

fn link_key(a: &PeerAddress, b: &PeerAddress) -> (PeerAddress, PeerAddress) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

pub struct MemoryRadio {
    address: PeerAddress,
    network: MemoryNetwork,
}

#[async_trait]
impl Radio for MemoryRadio {
    fn local_address(&self) -> &PeerAddress {
        &self.address
    }

    async fn scan(&self) -> Result<BoxStream<'static, PeerAddress>, RadioError> {
        let others: Vec<PeerAddress> = lock(&self.network.state)
            .radios
            .iter()
            .filter(|a| **a != self.address)
            .cloned()
            .collect();
        Ok(stream::iter(others).boxed())
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<Connection, RadioError> {
        self.network.connect(&self.address, peer)
    }
}

#[derive(Default)]
struct Served {
    values: HashMap<Characteristic, Vec<u8>>,
    closed: bool,
}

/// One direction of a link: what one end serves and notifies to the other.
struct Direction {
    served: watch::Sender<Served>,
    mailboxes: Mutex<HashMap<Characteristic, Mailbox>>,
}

impl Default for Direction {
    fn default() -> Self {
        let (served, _) = watch::channel(Served::default());
        Self {
            served,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }
}

impl Direction {
    fn with_mailbox<R>(
        &self,
        characteristic: Characteristic,
        open: bool,
        f: impl FnOnce(&mut Mailbox) -> R,
    ) -> R {
        let mut boxes = lock(&self.mailboxes);
        f(boxes
            .entry(characteristic)
            .or_insert_with(|| Mailbox::new(open)))
    }

    fn close(&self) {
        self.served.send_modify(|s| s.closed = true);
        for mailbox in lock(&self.mailboxes).values_mut() {
            mailbox.close();
        }
    }
}

#[derive(Default)]
struct Link {
    forward: Direction,
    backward: Direction,
    closed: AtomicBool,
}

/// One end of an in-memory link.
pub struct MemoryConnection {
    local: PeerAddress,
    remote: PeerAddress,
    link: Arc<Link>,
    forward: bool,
    network: Weak<Mutex<NetworkState>>,
}

impl MemoryConnection {
    fn outbound(&self) -> &Direction {
        if self.forward {
            &self.link.forward
        } else {
            &self.link.backward
        }
    }

    fn inbound(&self) -> &Direction {
        if self.forward {
            &self.link.backward
        } else {
            &self.link.forward
        }
    }

    fn ensure_open(&self) -> Result<(), RadioError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RadioError::Disconnected)
        }
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    fn address(&self) -> &PeerAddress {
        &self.remote
    }

    fn is_connected(&self) -> bool {
        !self.link.closed.load(Ordering::Acquire)
    }

    async fn notify(
        &self,
        characteristic: Characteristic,
        bytes: Vec<u8>,
    ) -> Result<(), RadioError> {
        self.ensure_open()?;
        self.outbound()
            .with_mailbox(characteristic, true, |m| m.push(characteristic, bytes))
    }

    async fn await_notification(
        &self,
        characteristic: Characteristic,
    ) -> Result<Notifications, RadioError> {
        let open = self.is_connected();
        self.inbound()
            .with_mailbox(characteristic, open, |m| m.subscribe(characteristic))
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, RadioError> {
        let mut rx = self.inbound().served.subscribe();
        loop {
            let ready = {
                let served = rx.borrow_and_update();
                match served.values.get(&characteristic) {
                    Some(value) => Some(Ok(value.clone())),
                    None if served.closed => Some(Err(RadioError::Disconnected)),
                    None => None,
                }
            };
            if let Some(result) = ready {
                return result;
            }
            rx.changed().await.map_err(|_| RadioError::Disconnected)?;
        }
    }

    async fn serve(
        &self,
        characteristic: Characteristic,
        value: Vec<u8>,
    ) -> Result<(), RadioError> {
        self.ensure_open()?;
        self.outbound().served.send_modify(|s| {
            s.values.insert(characteristic, value);
        });
        Ok(())
    }

    async fn disconnect(&self) {
        if self.link.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.forward.close();
        self.link.backward.close();
        if let Some(state) = self.network.upgrade() {
            MemoryNetwork { state }.forget(self);
        }
    }
}

/// Bootstrap target that records every handoff instead of bringing anything up.
pub struct RecordingBootstrap {
    supported: Vec<Capability>,
    metadata: Metadata,
    handoffs: Mutex<Vec<BootstrapDescriptor>>,
}

impl RecordingBootstrap {
    /// Supports `capabilities`; prepares a fixed Wi-Fi Direct group.
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("name".into(), "DIRECT-meshlink".into());
        metadata.insert("passphrase".into(), "meshlink-memory".into());
        Self {
            supported: capabilities.into_iter().collect(),
            metadata,
            handoffs: Mutex::new(Vec::new()),
        }
    }

    /// Replace what `prepare` returns.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn handoffs(&self) -> Vec<BootstrapDescriptor> {
        lock(&self.handoffs).clone()
    }
}

#[async_trait]
impl BootstrapTarget for RecordingBootstrap {
    fn supports(&self, capability: Capability) -> bool {
        self.supported.contains(&capability)
    }

    async fn prepare(&self, capability: Capability) -> Result<Metadata, BootstrapError> {
        if !self.supports(capability) {
            return Err(BootstrapError::Unsupported(capability));
        }
        Ok(self.metadata.clone())
    }

    async fn bootstrap(&self, descriptor: BootstrapDescriptor) -> HandshakeResult {
        lock(&self.handoffs).push(descriptor);
        HandshakeResult::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{channel_characteristic, MAILBOX_CAPACITY};

    async fn pair() -> (Connection, Connection, MemoryNetwork) {
        let net = MemoryNetwork::new();
        let a = net.radio("a");
        let b = net.radio("b");
        let ab = a.connect(&"b".into()).await.unwrap();
        let ba = b.connect(&"a".into()).await.unwrap();
        (ab, ba, net)
    }

    #[tokio::test]
    async fn scan_lists_other_radios() {
        let net = MemoryNetwork::new();
        let a = net.radio("a");
        net.radio("b");
        net.radio("c");
        let seen: Vec<PeerAddress> = a.scan().await.unwrap().collect().await;
        assert_eq!(seen, vec![PeerAddress::from("b"), PeerAddress::from("c")]);
    }

    #[tokio::test]
    async fn both_sides_share_one_link() {
        let (ab, ba, net) = pair().await;
        assert_eq!(ab.address(), &PeerAddress::from("b"));
        assert_eq!(ba.address(), &PeerAddress::from("a"));
        assert_eq!(net.open_links(), 1);
    }

    #[tokio::test]
    async fn notify_before_subscribe_is_queued() {
        let (ab, ba, _net) = pair().await;
        let ch = channel_characteristic(2);
        ab.notify(ch, vec![1, 2]).await.unwrap();
        ab.notify(ch, vec![3]).await.unwrap();
        let mut inbox = ba.await_notification(ch).await.unwrap();
        assert_eq!(inbox.next().await, Some(vec![1, 2]));
        assert_eq!(inbox.next().await, Some(vec![3]));
    }

    #[tokio::test]
    async fn unread_notifications_are_bounded() {
        let (ab, _ba, _net) = pair().await;
        let ch = channel_characteristic(4);
        for i in 0..MAILBOX_CAPACITY {
            ab.notify(ch, vec![i as u8]).await.unwrap();
        }
        assert!(matches!(
            ab.notify(ch, vec![0]).await,
            Err(RadioError::Overflow(c)) if c == ch
        ));
    }

    #[tokio::test]
    async fn second_subscriber_refused() {
        let (_ab, ba, _net) = pair().await;
        let ch = channel_characteristic(0);
        let _inbox = ba.await_notification(ch).await.unwrap();
        assert!(matches!(
            ba.await_notification(ch).await,
            Err(RadioError::AlreadySubscribed(_))
        ));
    }

    #[tokio::test]
    async fn read_waits_for_serve() {
        let (ab, ba, _net) = pair().await;
        let ch = channel_characteristic(9);
        let reader = tokio::spawn(async move { ba.read(ch).await });
        tokio::task::yield_now().await;
        ab.serve(ch, vec![9]).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn disconnect_drains_then_ends_stream_and_reads() {
        let (ab, ba, net) = pair().await;
        let ch = channel_characteristic(1);
        let mut inbox = ba.await_notification(ch).await.unwrap();
        ab.notify(ch, vec![7]).await.unwrap();
        ab.disconnect().await;
        assert!(!ba.is_connected());
        assert_eq!(inbox.next().await, Some(vec![7]));
        assert_eq!(inbox.next().await, None);
        assert!(matches!(ba.read(ch).await, Err(RadioError::Disconnected)));
        assert!(matches!(
            ba.notify(ch, vec![0]).await,
            Err(RadioError::Disconnected)
        ));
        assert_eq!(net.open_links(), 0);
    }

    #[tokio::test]
    async fn connect_to_unknown_radio_fails() {
        let net = MemoryNetwork::new();
        let a = net.radio("a");
        assert!(matches!(
            a.connect(&"nobody".into()).await,
            Err(RadioError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn recording_bootstrap_records_handoffs() {
        let target = RecordingBootstrap::new([Capability::Ble]);
        assert!(target.supports(Capability::Ble));
        assert!(!target.supports(Capability::WifiDirect));
        assert!(target.prepare(Capability::WifiDirect).await.is_err());
        let descriptor = crate::bootstrap::dispatch(
            Capability::Ble,
            crate::protocol::Role::Initiator,
            Metadata::new(),
        )
        .unwrap();
        assert!(target.bootstrap(descriptor.clone()).await.is_success());
        assert_eq!(target.handoffs(), vec![descriptor]);
    }
}
