//! Hash-then-reveal commitments: SHA-256 over salt || canonical value bytes.
//!
//! A value is first sent as [`Sealed::Hashed`], and only once both sides have
//! committed is it sent again as [`Sealed::Revealed`] with its salt. The
//! receiver keeps both halves in a [`CommitmentPair`] and refuses the value
//! unless the reveal recomputes to the committed hash.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::protocol::ElectionVote;

pub const SALT_LEN: usize = 32;
pub const HASH_LEN: usize = 32;

/// Random salt mixed into a commitment so small value spaces can't be brute-forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Salt(pub [u8; SALT_LEN]);

impl Salt {
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut bytes);
        Salt(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitHash(pub [u8; HASH_LEN]);

/// Canonical byte form of a committed value. Must be stable across builds and peers.
pub trait Committable {
    fn commitment_bytes(&self) -> Vec<u8>;
}

impl Committable for Uuid {
    fn commitment_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Committable for ElectionVote {
    fn commitment_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(17);
        out.extend_from_slice(self.tiebreaker.as_bytes());
        out.push(self.capability.code());
        out
    }
}

/// Commit to `value` under `salt`.
pub fn commit<T: Committable>(value: &T, salt: &Salt) -> CommitHash {
    let mut hasher = Sha256::new();
    hasher.update(salt.0);
    hasher.update(value.commitment_bytes());
    CommitHash(hasher.finalize().into())
}

/// Recompute the commitment and compare. Every byte is compared; no early exit.
pub fn verify<T: Committable>(committed: &CommitHash, value: &T, salt: &Salt) -> bool {
    let recomputed = commit(value, salt);
    recomputed
        .0
        .iter()
        .zip(committed.0.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// One half of a commitment as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sealed<T> {
    Hashed(CommitHash),
    Revealed { value: T, salt: Salt },
}

impl<T: Committable> Sealed<T> {
    /// Hashed half for `value`.
    pub fn hashed(value: &T, salt: &Salt) -> Self {
        Sealed::Hashed(commit(value, salt))
    }
}

impl<T> Sealed<T> {
    pub fn is_hashed(&self) -> bool {
        matches!(self, Sealed::Hashed(_))
    }
}

/// Both halves of a peer's commitment, collected across two stages.
#[derive(Debug, Clone)]
pub struct CommitmentPair<T> {
    hashed: Option<Sealed<T>>,
    revealed: Option<Sealed<T>>,
}

impl<T> Default for CommitmentPair<T> {
    fn default() -> Self {
        Self {
            hashed: None,
            revealed: None,
        }
    }
}

impl<T: Committable> CommitmentPair<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the packet received during the commit stage.
    pub fn record_hashed(&mut self, half: Sealed<T>) {
        self.hashed = Some(half);
    }

    /// Record the packet received during the reveal stage.
    pub fn record_revealed(&mut self, half: Sealed<T>) {
        self.revealed = Some(half);
    }

    /// Check the pair and return the revealed value. Fails closed on anything but
    /// exactly one hashed half followed by one matching revealed half.
    pub fn verify(&self) -> Result<&T, CommitmentError> {
        let hashed = self.hashed.as_ref().ok_or(CommitmentError::MissingCommit)?;
        let revealed = self.revealed.as_ref().ok_or(CommitmentError::MissingReveal)?;
        match (hashed, revealed) {
            (Sealed::Hashed(hash), Sealed::Revealed { value, salt }) => {
                if verify(hash, value, salt) {
                    Ok(value)
                } else {
                    Err(CommitmentError::HashMismatch)
                }
            }
            _ => Err(CommitmentError::SameSide),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitmentError {
    #[error("no commitment was received")]
    MissingCommit,
    #[error("commitment was never revealed")]
    MissingReveal,
    #[error("both halves carry the same hashed flag")]
    SameSide,
    #[error("revealed value does not match commitment")]
    HashMismatch,
}
