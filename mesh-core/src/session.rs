//! One handshake with one peer.
//!
//! Each stage has two halves that run concurrently. `respond` notifies this
//! device's packet on its own leased channel; `initiate` reads and validates
//! the peer's packet from the peer's channel and decides the next stage. Both
//! must finish before the session moves on, and only `initiate` may mutate the
//! session (through the [`StageResult`] it returns).

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::allocator::{AllocatorError, ChannelAllocator, ChannelLease};
use crate::bootstrap::{self, BootstrapDescriptor, BootstrapError, BootstrapTarget};
use crate::commitment::{CommitmentError, CommitmentPair, Salt, Sealed};
use crate::config::MeshConfig;
use crate::election::{self, ElectionBallot, ElectionError, ElectionResolver};
use crate::identity::{LocalIdentity, PeerRegistry, Registration, RotateOnDrop};
use crate::protocol::{Capability, ElectionVote, Metadata, Packet, Role, PROTOCOL_VERSION};
use crate::radio::{
    channel_characteristic, Characteristic, Connection, Notifications, PeerAddress, RadioError,
    CHANNEL_SELECT,
};
use crate::stage::{StageError, StageId};
use crate::wire::{self, DecodeError, EncodeError};

/// Shared state every session on this device borrows.
#[derive(Clone)]
pub struct SessionContext {
    pub identity: Arc<LocalIdentity>,
    pub registry: Arc<PeerRegistry>,
    pub allocator: Arc<ChannelAllocator>,
    pub bootstrap: Arc<dyn BootstrapTarget>,
    pub config: Arc<MeshConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error("radio: {0}")]
    Radio(#[from] RadioError),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode: {0}")]
    Encode(#[from] EncodeError),
    #[error("commitment: {0}")]
    Commitment(#[from] CommitmentError),
    #[error("election: {0}")]
    Election(#[from] ElectionError),
    #[error("bootstrap: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    OutOfOrder(#[from] StageError),
    #[error("peer {0} already has a session")]
    DuplicatePeer(Uuid),
    #[error("stage {0} timed out")]
    Timeout(StageId),
    #[error("peer never announced its channel")]
    ChannelSelectTimeout,
    #[error("channel select value is {0} bytes, expected 1")]
    BadChannelSelect(usize),
    #[error("unexpected {got} packet during {stage}")]
    UnexpectedPacket { stage: StageId, got: &'static str },
    #[error("peer speaks protocol version {0}, we speak {}", PROTOCOL_VERSION)]
    VersionMismatch(u8),
    #[error("elected capability {0} can't be bootstrapped")]
    UnsupportedCapability(Capability),
    #[error("peer sent upgrade for {got}, election chose {elected}")]
    UpgradeMismatch { elected: Capability, got: Capability },
    #[error("peer closed the link")]
    PeerClosed,
}

impl SessionError {
    /// A commitment or election check failed: the peer sent something it
    /// didn't commit to.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            SessionError::Commitment(_) | SessionError::Election(ElectionError::Commitment(_))
        )
    }
}

/// Terminal event of one session.
#[derive(Debug)]
pub enum SessionOutcome {
    Success(BootstrapDescriptor),
    /// The peer's id belongs to a session already running. Nothing is reported.
    Duplicate,
    Failure(SessionError),
}

impl SessionOutcome {
    pub fn from_result(result: Result<BootstrapDescriptor, SessionError>) -> Self {
        match result {
            Ok(descriptor) => SessionOutcome::Success(descriptor),
            Err(SessionError::DuplicatePeer(_)) => SessionOutcome::Duplicate,
            Err(e) => SessionOutcome::Failure(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Success(_))
    }
}

#[derive(Debug)]
enum Update {
    Nothing,
    PeerLuidCommitted(Sealed<Uuid>),
    PeerLuidVerified {
        luid: Uuid,
        registration: Registration,
    },
    PeerAdvertised(Vec<Capability>),
    PeerBallotCommitted(Sealed<ElectionVote>),
    Elected {
        capability: Capability,
        role: Role,
    },
    Handoff(BootstrapDescriptor),
}

/// What an initiator handler decided.
#[derive(Debug)]
pub(crate) struct StageResult {
    next: StageId,
    update: Update,
}

impl StageResult {
    fn next(next: StageId, update: Update) -> Self {
        Self { next, update }
    }
}

pub struct Session {
    peer: PeerAddress,
    conn: Connection,
    ctx: SessionContext,
    stage: StageId,
    history: Vec<StageId>,
    luid: Uuid,
    luid_salt: Salt,
    peer_luid_pair: CommitmentPair<Uuid>,
    peer_luid: Option<Uuid>,
    peer_capabilities: Vec<Capability>,
    ballot: Option<ElectionBallot>,
    own_ballot: CommitmentPair<ElectionVote>,
    peer_ballot: CommitmentPair<ElectionVote>,
    role: Option<Role>,
    upgrade_target: Option<Capability>,
    offered: Metadata,
    peer_channel: Characteristic,
    inbound: Mutex<Notifications>,
    registration: Option<Registration>,
    lease: ChannelLease,
    _rotate: RotateOnDrop,
}

impl Session {
    /// Lease a channel, swap channel ids with the peer and subscribe to theirs.
    pub async fn establish(conn: Connection, ctx: SessionContext) -> Result<Session, SessionError> {
        let lease = ctx
            .allocator
            .acquire_within(ctx.config.lease_timeout())
            .await?;
        let rotate = RotateOnDrop::new(Arc::clone(&ctx.identity));
        let luid = ctx.identity.current();

        conn.serve(CHANNEL_SELECT, vec![lease.channel_id()]).await?;
        let select = tokio::time::timeout(ctx.config.stage_timeout(), conn.read(CHANNEL_SELECT))
            .await
            .map_err(|_| SessionError::ChannelSelectTimeout)??;
        let &[peer_channel_id] = select.as_slice() else {
            return Err(SessionError::BadChannelSelect(select.len()));
        };
        let peer_channel = channel_characteristic(peer_channel_id);
        let inbound = conn.await_notification(peer_channel).await?;
        debug!(
            channel = lease.channel_id(),
            peer_channel = peer_channel_id,
            "channels selected"
        );

        Ok(Session {
            peer: conn.address().clone(),
            conn,
            ctx,
            stage: StageId::first(),
            history: vec![StageId::first()],
            luid,
            luid_salt: Salt::random(),
            peer_luid_pair: CommitmentPair::new(),
            peer_luid: None,
            peer_capabilities: Vec::new(),
            ballot: None,
            own_ballot: CommitmentPair::new(),
            peer_ballot: CommitmentPair::new(),
            role: None,
            upgrade_target: None,
            offered: Metadata::new(),
            peer_channel,
            inbound: Mutex::new(inbound),
            registration: None,
            lease,
            _rotate: rotate,
        })
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Every stage entered so far, in order.
    pub fn history(&self) -> &[StageId] {
        &self.history
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn upgrade_target(&self) -> Option<Capability> {
        self.upgrade_target
    }

    /// This session's snapshot of the device's ephemeral id.
    pub fn luid(&self) -> Uuid {
        self.luid
    }

    pub fn channel_id(&self) -> u8 {
        self.lease.channel_id()
    }

    pub fn peer_channel(&self) -> Characteristic {
        self.peer_channel
    }

    /// Run the current stage to completion. Returns the descriptor once the
    /// upgrade stage has produced one.
    pub async fn step(&mut self) -> Result<Option<BootstrapDescriptor>, SessionError> {
        let stage = self.stage;
        self.enter(stage).await?;
        let ((), result) = tokio::try_join!(self.respond(stage), self.initiate(stage))?;
        self.apply(result)
    }

    /// Jump straight to `Exit` after a failure.
    pub fn abort(&mut self) {
        if !self.stage.is_terminal() {
            self.stage = StageId::Exit;
            self.history.push(StageId::Exit);
        }
    }

    async fn enter(&mut self, stage: StageId) -> Result<(), SessionError> {
        match stage {
            StageId::ElectionHashed => {
                let bootstrap = &self.ctx.bootstrap;
                let vote = election::choose_vote(
                    &self.ctx.config.capabilities,
                    &self.peer_capabilities,
                    |c| bootstrap.supports(c),
                );
                let ballot = ElectionBallot::new(vote);
                self.own_ballot.record_hashed(ballot.hashed());
                self.own_ballot.record_revealed(ballot.revealed());
                self.ballot = Some(ballot);
            }
            StageId::Upgrade => {
                if let (Some(Role::Initiator), Some(target)) = (self.role, self.upgrade_target) {
                    self.offered = self.ctx.bootstrap.prepare(target).await?;
                }
            }
            StageId::LuidHashed
            | StageId::Luid
            | StageId::Advertise
            | StageId::Election
            | StageId::Exit => {}
        }
        Ok(())
    }

    async fn send(&self, packet: Packet) -> Result<(), SessionError> {
        let frame = wire::encode(&packet)?;
        self.conn.notify(self.lease.characteristic(), frame).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Packet, SessionError> {
        let frame = self
            .inbound
            .lock()
            .await
            .next()
            .await
            .ok_or(SessionError::PeerClosed)?;
        Ok(wire::decode(&frame)?)
    }

    fn ballot(&self) -> Result<&ElectionBallot, SessionError> {
        self.ballot
            .as_ref()
            .ok_or(SessionError::Commitment(CommitmentError::MissingCommit))
    }

    /// Send this device's packet for `stage`.
    async fn respond(&self, stage: StageId) -> Result<(), SessionError> {
        let packet = match stage {
            StageId::LuidHashed => Packet::Luid(Sealed::hashed(&self.luid, &self.luid_salt)),
            StageId::Luid => Packet::Luid(Sealed::Revealed {
                value: self.luid,
                salt: self.luid_salt,
            }),
            StageId::Advertise => {
                let capabilities = self
                    .ctx
                    .config
                    .capabilities
                    .iter()
                    .copied()
                    .filter(|c| c.is_valid() && self.ctx.bootstrap.supports(*c))
                    .collect();
                Packet::Advertise {
                    protocol_version: PROTOCOL_VERSION,
                    capabilities,
                }
            }
            StageId::ElectionHashed => Packet::Election(self.ballot()?.hashed()),
            StageId::Election => Packet::Election(self.ballot()?.revealed()),
            StageId::Upgrade => match (self.role, self.upgrade_target) {
                (Some(Role::Initiator), Some(capability)) => Packet::Upgrade {
                    capability,
                    metadata: self.offered.clone(),
                },
                _ => return Ok(()),
            },
            StageId::Exit => return Ok(()),
        };
        self.send(packet).await
    }

    /// Receive and check the peer's packet for `stage`.
    async fn initiate(&self, stage: StageId) -> Result<StageResult, SessionError> {
        let unexpected = |packet: &Packet| SessionError::UnexpectedPacket {
            stage,
            got: packet.kind(),
        };
        match stage {
            StageId::LuidHashed => match self.recv().await? {
                Packet::Luid(half @ Sealed::Hashed(_)) => Ok(StageResult::next(
                    StageId::Luid,
                    Update::PeerLuidCommitted(half),
                )),
                other => Err(unexpected(&other)),
            },
            StageId::Luid => {
                let half = match self.recv().await? {
                    Packet::Luid(half @ Sealed::Revealed { .. }) => half,
                    other => return Err(unexpected(&other)),
                };
                let mut pair = self.peer_luid_pair.clone();
                pair.record_revealed(half);
                let luid = *pair.verify()?;
                if luid == self.luid {
                    return Err(SessionError::DuplicatePeer(luid));
                }
                let registry = &self.ctx.registry;
                let Some(registration) = registry.register(luid, self.peer.clone()) else {
                    let holder = registry.peer_for(&luid);
                    debug!(peer = %self.peer, ?holder, %luid, "luid already verified");
                    return Err(SessionError::DuplicatePeer(luid));
                };
                Ok(StageResult::next(
                    StageId::Advertise,
                    Update::PeerLuidVerified { luid, registration },
                ))
            }
            StageId::Advertise => match self.recv().await? {
                Packet::Advertise {
                    protocol_version,
                    capabilities,
                } => {
                    if protocol_version != PROTOCOL_VERSION {
                        return Err(SessionError::VersionMismatch(protocol_version));
                    }
                    Ok(StageResult::next(
                        StageId::ElectionHashed,
                        Update::PeerAdvertised(capabilities),
                    ))
                }
                other => Err(unexpected(&other)),
            },
            StageId::ElectionHashed => match self.recv().await? {
                Packet::Election(half @ Sealed::Hashed(_)) => Ok(StageResult::next(
                    StageId::Election,
                    Update::PeerBallotCommitted(half),
                )),
                other => Err(unexpected(&other)),
            },
            StageId::Election => {
                let half = match self.recv().await? {
                    Packet::Election(half @ Sealed::Revealed { .. }) => half,
                    other => return Err(unexpected(&other)),
                };
                let mut peer_ballot = self.peer_ballot.clone();
                peer_ballot.record_revealed(half);
                let mut resolver = ElectionResolver::new();
                resolver.add(self.own_ballot.clone()).add(peer_ballot);
                let capability = resolver.resolve()?;
                if !capability.is_valid() || !self.ctx.bootstrap.supports(capability) {
                    return Err(SessionError::UnsupportedCapability(capability));
                }
                let peer_luid = self
                    .peer_luid
                    .ok_or(SessionError::Commitment(CommitmentError::MissingReveal))?;
                let role = election::role_for(self.luid, peer_luid);
                Ok(StageResult::next(
                    StageId::Upgrade,
                    Update::Elected { capability, role },
                ))
            }
            StageId::Upgrade => {
                let (Some(role), Some(elected)) = (self.role, self.upgrade_target) else {
                    return Err(SessionError::UnsupportedCapability(Capability::Invalid));
                };
                let descriptor = match role {
                    Role::Initiator => bootstrap::dispatch(elected, role, self.offered.clone())?,
                    Role::Responder => match self.recv().await? {
                        Packet::Upgrade {
                            capability,
                            metadata,
                        } => {
                            if capability != elected {
                                return Err(SessionError::UpgradeMismatch {
                                    elected,
                                    got: capability,
                                });
                            }
                            bootstrap::dispatch(capability, role, metadata)?
                        }
                        other => return Err(unexpected(&other)),
                    },
                };
                Ok(StageResult::next(StageId::Exit, Update::Handoff(descriptor)))
            }
            StageId::Exit => Ok(StageResult::next(StageId::Exit, Update::Nothing)),
        }
    }

    pub(crate) fn apply(
        &mut self,
        result: StageResult,
    ) -> Result<Option<BootstrapDescriptor>, SessionError> {
        let next = self.stage.transition(result.next)?;
        debug!(from = %self.stage, to = %next, "stage transition");
        if next != self.stage {
            self.history.push(next);
        }
        self.stage = next;
        let handoff = match result.update {
            Update::Nothing => None,
            Update::PeerLuidCommitted(half) => {
                self.peer_luid_pair.record_hashed(half);
                None
            }
            Update::PeerLuidVerified { luid, registration } => {
                self.peer_luid = Some(luid);
                self.registration = Some(registration);
                None
            }
            Update::PeerAdvertised(capabilities) => {
                self.peer_capabilities = capabilities;
                None
            }
            Update::PeerBallotCommitted(half) => {
                self.peer_ballot.record_hashed(half);
                None
            }
            Update::Elected { capability, role } => {
                self.upgrade_target = Some(capability);
                self.role = Some(role);
                None
            }
            Update::Handoff(descriptor) => Some(descriptor),
        };
        Ok(handoff)
    }

    /// Log a failed stage at the right level.
    pub(crate) fn report_failure(&self, err: &SessionError) {
        if err.is_verification_failure() {
            warn!(stage = %self.stage, error = %err, "peer failed verification");
        } else {
            debug!(stage = %self.stage, error = %err, "stage failed");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("stage", &self.stage)
            .field("role", &self.role)
            .field("upgrade_target", &self.upgrade_target)
            .field("channel", &self.lease.channel_id())
            .finish_non_exhaustive()
    }
}
