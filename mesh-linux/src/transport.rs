//! LAN link: one TCP connection per peer pair carrying characteristic
//! operations as length-prefixed bincode frames.
//!
//! The dialling side opens with `Hello` so the acceptor learns which node it
//! is talking to. After that both ends are symmetric.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use mesh_core::radio::{Mailbox, Notifications};
use mesh_core::{Characteristic, Connection, PeerAddress, PeerConnection, Radio, RadioError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::discovery::PeerTable;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 1024 * 1024;
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the higher node id waits for the lower one to dial in.
const DIAL_IN_TIMEOUT: Duration = Duration::from_secs(10);
/// Distinct characteristics a peer may notify on before we drop the link.
const MAX_MAILBOXES: usize = 16;
const MAX_DEFERRED_READS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    Hello { node: Uuid },
    Notify { characteristic: Characteristic, bytes: Vec<u8> },
    Read { id: u32, characteristic: Characteristic },
    ReadReply { id: u32, value: Vec<u8> },
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &LinkFrame,
) -> std::io::Result<()> {
    let body = bincode::serialize(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|n| *n <= MAX_FRAME_LEN)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<LinkFrame> {
    let mut len_buf = [0u8; LEN_SIZE];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame length over limit",
        ));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Default)]
struct LinkState {
    mailboxes: HashMap<Characteristic, Mailbox>,
    served: HashMap<Characteristic, Vec<u8>>,
    /// Peer reads of characteristics we haven't served yet.
    deferred_reads: Vec<(u32, Characteristic)>,
    our_reads: HashMap<u32, oneshot::Sender<Vec<u8>>>,
}

/// One end of a TCP link to a peer.
pub struct TcpLink {
    peer: PeerAddress,
    outbound: Mutex<Option<mpsc::UnboundedSender<LinkFrame>>>,
    state: Mutex<LinkState>,
    next_read: AtomicU32,
    closed: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Removes a pending read's waiter however the read ends.
struct PendingRead<'a> {
    link: &'a TcpLink,
    id: u32,
}

impl Drop for PendingRead<'_> {
    fn drop(&mut self) {
        lock(&self.link.state).our_reads.remove(&self.id);
    }
}

impl TcpLink {
    /// Take over `stream`, already past the hello exchange.
    pub fn spawn(stream: TcpStream, peer: PeerAddress) -> Arc<TcpLink> {
        let (tx, mut rx) = mpsc::unbounded_channel::<LinkFrame>();
        let link = Arc::new(TcpLink {
            peer,
            outbound: Mutex::new(Some(tx)),
            state: Mutex::new(LinkState::default()),
            next_read: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        let (mut reader, mut writer) = stream.into_split();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });
        let reader_link = Arc::clone(&link);
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = match read_frame(&mut reader).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(peer = %reader_link.peer, error = %e, "link read ended");
                        break;
                    }
                };
                if let Err(e) = reader_link.on_frame(frame) {
                    warn!(peer = %reader_link.peer, error = %e, "dropping misbehaving link");
                    break;
                }
            }
            reader_link.close();
        });
        lock(&link.tasks).extend([writer_task.abort_handle(), reader_task.abort_handle()]);
        link
    }

    fn send(&self, frame: LinkFrame) -> Result<(), RadioError> {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| RadioError::Disconnected),
            None => Err(RadioError::Disconnected),
        }
    }

    /// Apply one inbound frame. An error means the peer overran a limit and
    /// the link should go.
    fn on_frame(&self, frame: LinkFrame) -> Result<(), RadioError> {
        trace!(peer = %self.peer, ?frame, "frame in");
        match frame {
            LinkFrame::Hello { .. } => Ok(()),
            LinkFrame::Notify {
                characteristic,
                bytes,
            } => {
                let open = self.is_connected();
                let mut state = lock(&self.state);
                if !state.mailboxes.contains_key(&characteristic)
                    && state.mailboxes.len() >= MAX_MAILBOXES
                {
                    return Err(RadioError::Overflow(characteristic));
                }
                state
                    .mailboxes
                    .entry(characteristic)
                    .or_insert_with(|| Mailbox::new(open))
                    .push(characteristic, bytes)
                    .or_else(|e| match e {
                        // Closed locally; nothing left to deliver to.
                        RadioError::Disconnected => Ok(()),
                        other => Err(other),
                    })
            }
            LinkFrame::Read { id, characteristic } => {
                let value = {
                    let mut state = lock(&self.state);
                    let value = state.served.get(&characteristic).cloned();
                    if value.is_none() {
                        if state.deferred_reads.len() >= MAX_DEFERRED_READS {
                            return Err(RadioError::Overflow(characteristic));
                        }
                        state.deferred_reads.push((id, characteristic));
                    }
                    value
                };
                if let Some(value) = value {
                    let _ = self.send(LinkFrame::ReadReply { id, value });
                }
                Ok(())
            }
            LinkFrame::ReadReply { id, value } => {
                if let Some(waiter) = lock(&self.state).our_reads.remove(&id) {
                    let _ = waiter.send(value);
                }
                Ok(())
            }
        }
    }

    /// Tear down without waiting. Safe to call more than once.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.outbound).take();
        {
            let mut state = lock(&self.state);
            for mailbox in state.mailboxes.values_mut() {
                mailbox.close();
            }
            state.our_reads.clear();
            state.deferred_reads.clear();
        }
        debug!(peer = %self.peer, "link closed");
    }

    #[cfg(test)]
    fn pending_reads(&self) -> usize {
        lock(&self.state).our_reads.len()
    }
}

#[async_trait]
impl PeerConnection for TcpLink {
    fn address(&self) -> &PeerAddress {
        &self.peer
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn notify(
        &self,
        characteristic: Characteristic,
        bytes: Vec<u8>,
    ) -> Result<(), RadioError> {
        self.send(LinkFrame::Notify {
            characteristic,
            bytes,
        })
    }

    async fn await_notification(
        &self,
        characteristic: Characteristic,
    ) -> Result<Notifications, RadioError> {
        let open = self.is_connected();
        lock(&self.state)
            .mailboxes
            .entry(characteristic)
            .or_insert_with(|| Mailbox::new(open))
            .subscribe(characteristic)
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, RadioError> {
        let id = self.next_read.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            // `close` flips the flag before it clears waiters under this lock.
            let mut state = lock(&self.state);
            if !self.is_connected() {
                return Err(RadioError::Disconnected);
            }
            state.our_reads.insert(id, tx);
        }
        let _pending = PendingRead { link: self, id };
        self.send(LinkFrame::Read { id, characteristic })?;
        rx.await.map_err(|_| RadioError::Disconnected)
    }

    async fn serve(
        &self,
        characteristic: Characteristic,
        value: Vec<u8>,
    ) -> Result<(), RadioError> {
        let answer: Vec<u32> = {
            let mut state = lock(&self.state);
            state.served.insert(characteristic, value.clone());
            let (now, later): (Vec<_>, Vec<_>) = std::mem::take(&mut state.deferred_reads)
                .into_iter()
                .partition(|(_, c)| *c == characteristic);
            state.deferred_reads = later;
            now.into_iter().map(|(id, _)| id).collect()
        };
        for id in answer {
            self.send(LinkFrame::ReadReply {
                id,
                value: value.clone(),
            })?;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.close();
        // The writer drains what's queued once `outbound` is dropped; only the
        // reader is stopped here.
        if let Some(reader) = lock(&self.tasks).get(1) {
            reader.abort();
        }
    }
}

/// [`Radio`] over the LAN. Peers are addressed by node id; between any two
/// nodes the lower id dials and the other side picks up the accepted link.
pub struct LanRadio {
    node: Uuid,
    local: PeerAddress,
    peers: PeerTable,
    accepted: Mutex<HashMap<PeerAddress, Arc<TcpLink>>>,
    arrived: Notify,
}

impl LanRadio {
    pub fn new(node: Uuid, peers: PeerTable) -> Arc<LanRadio> {
        Arc::new(LanRadio {
            node,
            local: PeerAddress::from(node.to_string()),
            peers,
            accepted: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
        })
    }

    /// Accept links from lower node ids until the listener fails.
    pub async fn accept_links(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = ?listener.local_addr()?, "link listener up");
        loop {
            let (mut stream, from) = listener.accept().await?;
            let radio = Arc::clone(&self);
            tokio::spawn(async move {
                match tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut stream)).await {
                    Ok(Ok(LinkFrame::Hello { node })) => radio.adopt(stream, node),
                    Ok(Ok(other)) => warn!(%from, ?other, "link did not open with hello"),
                    Ok(Err(e)) => warn!(%from, error = %e, "link hello failed"),
                    Err(_) => warn!(%from, "link hello timed out"),
                }
            });
        }
    }

    fn adopt(&self, stream: TcpStream, node: Uuid) {
        let peer = PeerAddress::from(node.to_string());
        debug!(%peer, "accepted link");
        let link = TcpLink::spawn(stream, peer.clone());
        if let Some(old) = lock(&self.accepted).insert(peer, link) {
            old.close();
        }
        self.arrived.notify_waiters();
    }

    async fn dial(&self, peer: &PeerAddress, node: Uuid) -> Result<Connection, RadioError> {
        let addr = self
            .peers
            .addr_of(&node)
            .ok_or_else(|| RadioError::NotFound(peer.clone()))?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RadioError::ConnectFailed(peer.clone(), e.to_string()))?;
        write_frame(&mut stream, &LinkFrame::Hello { node: self.node }).await?;
        Ok(TcpLink::spawn(stream, peer.clone()) as Connection)
    }

    async fn await_dial_in(&self, peer: &PeerAddress) -> Result<Connection, RadioError> {
        let deadline = tokio::time::Instant::now() + DIAL_IN_TIMEOUT;
        loop {
            let arrived = self.arrived.notified();
            if let Some(link) = lock(&self.accepted).remove(peer) {
                if link.is_connected() {
                    return Ok(link as Connection);
                }
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Err(RadioError::ConnectFailed(
                    peer.clone(),
                    "peer never dialled in".into(),
                ));
            }
        }
    }
}

#[async_trait]
impl Radio for LanRadio {
    fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    async fn scan(&self) -> Result<BoxStream<'static, PeerAddress>, RadioError> {
        let found: Vec<PeerAddress> = self
            .peers
            .nodes()
            .into_iter()
            .map(|n| PeerAddress::from(n.to_string()))
            .collect();
        Ok(stream::iter(found).boxed())
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<Connection, RadioError> {
        let node: Uuid = peer
            .as_str()
            .parse()
            .map_err(|_| RadioError::NotFound(peer.clone()))?;
        if self.node < node {
            self.dial(peer, node).await
        } else {
            self.await_dial_in(peer).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::radio::{channel_characteristic, CHANNEL_SELECT, MAILBOX_CAPACITY};
    use tokio::net::TcpListener;

    async fn pair() -> (Arc<TcpLink>, Arc<TcpLink>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let a = TcpLink::spawn(dialed.unwrap(), "b".into());
        let b = TcpLink::spawn(accepted.unwrap().0, "a".into());
        (a, b)
    }

    #[tokio::test]
    async fn frame_roundtrip_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let frame = LinkFrame::Read {
            id: 4,
            characteristic: CHANNEL_SELECT,
        };
        write_frame(&mut client, &frame).await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_LEN + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_before_serve_is_answered_on_serve() {
        let (a, b) = pair().await;
        let reader = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.read(CHANNEL_SELECT).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        b.serve(CHANNEL_SELECT, vec![2]).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn notifications_arrive_in_order_and_end_on_disconnect() {
        let (a, b) = pair().await;
        let ch = channel_characteristic(1);
        let mut inbox = b.await_notification(ch).await.unwrap();
        a.notify(ch, vec![1]).await.unwrap();
        a.notify(ch, vec![2]).await.unwrap();
        assert_eq!(inbox.next().await, Some(vec![1]));
        assert_eq!(inbox.next().await, Some(vec![2]));
        a.disconnect().await;
        assert_eq!(inbox.next().await, None);
        assert!(!b.is_connected());
    }

    #[tokio::test]
    async fn notify_before_subscribe_is_delivered() {
        let (a, b) = pair().await;
        let ch = channel_characteristic(2);
        a.notify(ch, vec![9]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut inbox = b.await_notification(ch).await.unwrap();
        assert_eq!(inbox.next().await, Some(vec![9]));
    }

    #[tokio::test]
    async fn second_subscriber_refused() {
        let (_a, b) = pair().await;
        let ch = channel_characteristic(0);
        let _inbox = b.await_notification(ch).await.unwrap();
        assert!(matches!(
            b.await_notification(ch).await,
            Err(RadioError::AlreadySubscribed(c)) if c == ch
        ));
    }

    #[tokio::test]
    async fn read_on_closed_link_leaves_nothing_behind() {
        let (a, _b) = pair().await;
        a.disconnect().await;
        assert!(matches!(
            a.read(CHANNEL_SELECT).await,
            Err(RadioError::Disconnected)
        ));
        assert_eq!(a.pending_reads(), 0);
    }

    #[tokio::test]
    async fn abandoned_read_is_forgotten() {
        let (a, _b) = pair().await;
        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(20), a.read(CHANNEL_SELECT))
                .await;
        assert!(timed_out.is_err());
        assert_eq!(a.pending_reads(), 0);
    }

    async fn wait_closed(link: &TcpLink) {
        for _ in 0..100 {
            if !link.is_connected() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("link to {} stayed open", link.peer);
    }

    #[tokio::test]
    async fn notifying_on_too_many_characteristics_drops_link() {
        let (a, b) = pair().await;
        for id in 0..=MAX_MAILBOXES as u8 {
            a.notify(channel_characteristic(id), vec![id]).await.unwrap();
        }
        wait_closed(&b).await;
    }

    #[tokio::test]
    async fn flooding_one_characteristic_drops_link() {
        let (a, b) = pair().await;
        let ch = channel_characteristic(1);
        for i in 0..=MAILBOX_CAPACITY {
            a.notify(ch, vec![i as u8]).await.unwrap();
        }
        wait_closed(&b).await;
    }

    #[tokio::test]
    async fn unanswered_reads_are_capped() {
        let (a, b) = pair().await;
        for id in 0..=MAX_DEFERRED_READS as u32 {
            a.send(LinkFrame::Read {
                id,
                characteristic: CHANNEL_SELECT,
            })
            .unwrap();
        }
        wait_closed(&b).await;
    }

    #[tokio::test]
    async fn lower_node_dials_and_higher_node_picks_up() {
        let (lo, hi) = {
            let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
            (a.min(b), a.max(b))
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hi_addr = listener.local_addr().unwrap();

        let lo_peers = PeerTable::new();
        lo_peers.saw(hi, hi_addr, tokio::time::Instant::now());
        let lo_radio = LanRadio::new(lo, lo_peers);
        let hi_radio = LanRadio::new(hi, PeerTable::new());
        tokio::spawn(Arc::clone(&hi_radio).accept_links(listener));

        let hi_name = PeerAddress::from(hi.to_string());
        let lo_name = PeerAddress::from(lo.to_string());
        let scanned: Vec<PeerAddress> = lo_radio.scan().await.unwrap().collect().await;
        assert_eq!(scanned, vec![hi_name.clone()]);

        let (up, down) = tokio::join!(lo_radio.connect(&hi_name), hi_radio.connect(&lo_name));
        let (up, down) = (up.unwrap(), down.unwrap());
        assert_eq!(down.address(), &lo_name);
        up.serve(CHANNEL_SELECT, vec![3]).await.unwrap();
        assert_eq!(down.read(CHANNEL_SELECT).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn unknown_peer_is_not_found() {
        let radio = LanRadio::new(Uuid::nil(), PeerTable::new());
        let peer = PeerAddress::from(Uuid::from_u128(u128::MAX).to_string());
        assert!(matches!(
            radio.connect(&peer).await,
            Err(RadioError::NotFound(_))
        ));
        assert!(matches!(
            radio.connect(&"not-a-node".into()).await,
            Err(RadioError::NotFound(_))
        ));
    }
}
