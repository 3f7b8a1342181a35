//! Handshake stages. Strictly ordered; `Exit` is terminal and absorbing.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageId {
    LuidHashed,
    Luid,
    Advertise,
    ElectionHashed,
    Election,
    Upgrade,
    Exit,
}

impl StageId {
    pub const SEQUENCE: [StageId; 7] = [
        StageId::LuidHashed,
        StageId::Luid,
        StageId::Advertise,
        StageId::ElectionHashed,
        StageId::Election,
        StageId::Upgrade,
        StageId::Exit,
    ];

    /// First stage of every session.
    pub const fn first() -> StageId {
        StageId::LuidHashed
    }

    pub fn is_terminal(self) -> bool {
        self == StageId::Exit
    }

    /// The stage that normally follows this one.
    pub fn successor(self) -> StageId {
        match self {
            StageId::LuidHashed => StageId::Luid,
            StageId::Luid => StageId::Advertise,
            StageId::Advertise => StageId::ElectionHashed,
            StageId::ElectionHashed => StageId::Election,
            StageId::Election => StageId::Upgrade,
            StageId::Upgrade | StageId::Exit => StageId::Exit,
        }
    }

    /// Validate a requested transition. Any stage may jump to `Exit`; otherwise
    /// only the successor is allowed. Once at `Exit`, every request stays there.
    pub fn transition(self, next: StageId) -> Result<StageId, StageError> {
        if self.is_terminal() || next.is_terminal() || next == self.successor() {
            Ok(if self.is_terminal() { StageId::Exit } else { next })
        } else {
            Err(StageError::OutOfOrder {
                from: self,
                to: next,
            })
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StageId::LuidHashed => "luid-hashed",
            StageId::Luid => "luid",
            StageId::Advertise => "advertise",
            StageId::ElectionHashed => "election-hashed",
            StageId::Election => "election",
            StageId::Upgrade => "upgrade",
            StageId::Exit => "exit",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("transition {from} -> {to} is out of order")]
    OutOfOrder { from: StageId, to: StageId },
}
