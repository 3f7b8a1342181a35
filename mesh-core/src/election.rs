//! Leader election: tally revealed ballots and break ties deterministically.
//!
//! The winning capability is the unique plurality of votes. On a tie the pivot
//! is SHA-256 of the product of every tiebreaker (as unsigned big-endian
//! integers), cut to its first 16 bytes so it lies in the same range as the
//! tiebreakers. The tied ballot whose tiebreaker is nearest the pivot wins.
//! The same rule over ephemeral ids picks which device initiates the upgrade.
//! Every function here is independent of ballot order.

use std::collections::BTreeMap;

use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::commitment::{CommitmentError, CommitmentPair, Salt, Sealed};
use crate::protocol::{Capability, ElectionVote, Role};

/// This device's ballot for one session. Created at `ElectionHashed` entry.
#[derive(Debug, Clone)]
pub struct ElectionBallot {
    pub tiebreaker: Uuid,
    pub capability_vote: Capability,
    pub salt: Salt,
}

impl ElectionBallot {
    pub fn new(capability_vote: Capability) -> Self {
        Self {
            tiebreaker: Uuid::new_v4(),
            capability_vote,
            salt: Salt::random(),
        }
    }

    pub fn vote(&self) -> ElectionVote {
        ElectionVote {
            tiebreaker: self.tiebreaker,
            capability: self.capability_vote,
        }
    }

    pub fn hashed(&self) -> Sealed<ElectionVote> {
        Sealed::hashed(&self.vote(), &self.salt)
    }

    pub fn revealed(&self) -> Sealed<ElectionVote> {
        Sealed::Revealed {
            value: self.vote(),
            salt: self.salt,
        }
    }
}

/// Pick what to vote for: the first capability in `preference` the peer also
/// advertised and this build can bootstrap. `Invalid` if there is none.
pub fn choose_vote(
    preference: &[Capability],
    peer_advertised: &[Capability],
    supported: impl Fn(Capability) -> bool,
) -> Capability {
    preference
        .iter()
        .copied()
        .find(|c| c.is_valid() && peer_advertised.contains(c) && supported(*c))
        .unwrap_or(Capability::Invalid)
}

/// Collects every side's commitment pair and resolves once all are revealed.
#[derive(Debug, Default)]
pub struct ElectionResolver {
    ballots: Vec<CommitmentPair<ElectionVote>>,
}

impl ElectionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pair: CommitmentPair<ElectionVote>) -> &mut Self {
        self.ballots.push(pair);
        self
    }

    /// Verify every commitment, then tally.
    pub fn resolve(&self) -> Result<Capability, ElectionError> {
        if self.ballots.is_empty() {
            return Err(ElectionError::NoBallots);
        }
        let votes = self
            .ballots
            .iter()
            .map(|pair| pair.verify().copied())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(determine_capability(&votes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElectionError {
    #[error("no ballots to resolve")]
    NoBallots,
    #[error("ballot commitment invalid: {0}")]
    Commitment(#[from] CommitmentError),
}

/// Winning capability for a set of revealed votes. `Invalid` for no votes.
pub fn determine_capability(votes: &[ElectionVote]) -> Capability {
    let mut tally: BTreeMap<Capability, usize> = BTreeMap::new();
    for v in votes {
        *tally.entry(v.capability).or_insert(0) += 1;
    }
    let Some(&top) = tally.values().max() else {
        return Capability::Invalid;
    };
    let tied: Vec<Capability> = tally
        .iter()
        .filter(|(_, &n)| n == top)
        .map(|(c, _)| *c)
        .collect();
    if let [only] = tied.as_slice() {
        return *only;
    }
    let pivot = pivot(votes.iter().map(|v| &v.tiebreaker));
    let candidates = votes.iter().filter(|v| tied.contains(&v.capability));
    closest(&pivot, candidates, |v| &v.tiebreaker)
        .map(|v| v.capability)
        .unwrap_or(Capability::Invalid)
}

/// The ephemeral id nearest the pivot of all ids. `None` for an empty set.
pub fn select_leader(ids: &[Uuid]) -> Option<Uuid> {
    let pivot = pivot(ids.iter());
    closest(&pivot, ids.iter(), |id| id).copied()
}

/// Role of the device holding `own` in a session with `peer`.
pub fn role_for(own: Uuid, peer: Uuid) -> Role {
    match select_leader(&[own, peer]) {
        Some(leader) if leader == own => Role::Initiator,
        _ => Role::Responder,
    }
}

fn as_integer(id: &Uuid) -> BigUint {
    BigUint::from_bytes_be(id.as_bytes())
}

/// First 16 bytes of SHA-256 over the big-endian product of `values`, read
/// back as a 128-bit integer.
pub fn pivot<'a>(values: impl IntoIterator<Item = &'a Uuid>) -> BigUint {
    let product = values
        .into_iter()
        .fold(BigUint::from(1u8), |acc, id| acc * as_integer(id));
    let digest = Sha256::digest(product.to_bytes_be());
    BigUint::from_bytes_be(&digest[..16])
}

fn distance(a: &BigUint, b: &BigUint) -> BigUint {
    if a >= b {
        a - b
    } else {
        b - a
    }
}

/// Item whose id is nearest `pivot`; equal distances go to the smaller id.
fn closest<'a, T>(
    pivot: &BigUint,
    items: impl Iterator<Item = &'a T>,
    id: impl Fn(&T) -> &Uuid,
) -> Option<&'a T> {
    items
        .map(|item| {
            let value = as_integer(id(item));
            (distance(pivot, &value), value, item)
        })
        .min_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)))
        .map(|(_, _, item)| item)
}
