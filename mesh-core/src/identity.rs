//! Device identity: the ephemeral id (LUID) committed and revealed in every
//! handshake, and the registry of peers whose LUID is currently verified.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::radio::PeerAddress;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// This device's ephemeral id. Sessions take a snapshot at creation and the id
/// is re-randomized after each session ends, so a session in flight always
/// sees a stable self-identity.
#[derive(Debug)]
pub struct LocalIdentity {
    luid: Mutex<Uuid>,
    rotations: AtomicU64,
}

impl LocalIdentity {
    pub fn new() -> Self {
        Self::with_luid(Uuid::new_v4())
    }

    pub fn with_luid(luid: Uuid) -> Self {
        Self {
            luid: Mutex::new(luid),
            rotations: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Uuid {
        *lock(&self.luid)
    }

    /// Replace the ephemeral id with a fresh random one. Returns the new id.
    pub fn rotate(&self) -> Uuid {
        let next = Uuid::new_v4();
        *lock(&self.luid) = next;
        self.rotations.fetch_add(1, Ordering::Relaxed);
        next
    }

    /// Number of rotations so far.
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::new()
    }
}

/// Rotates the identity when dropped. Held by a session for its whole life.
pub struct RotateOnDrop(Arc<LocalIdentity>);

impl RotateOnDrop {
    pub fn new(identity: Arc<LocalIdentity>) -> Self {
        Self(identity)
    }
}

impl Drop for RotateOnDrop {
    fn drop(&mut self) {
        self.0.rotate();
    }
}

/// Peers whose revealed ephemeral id is verified and whose session is still
/// running. One physical peer can't hold two sessions at once.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    verified: Mutex<HashMap<Uuid, PeerAddress>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-insert. Returns `None` if `luid` is already registered.
    pub fn register(self: &Arc<Self>, luid: Uuid, peer: PeerAddress) -> Option<Registration> {
        let mut verified = lock(&self.verified);
        if verified.contains_key(&luid) {
            return None;
        }
        verified.insert(luid, peer);
        Some(Registration {
            registry: Arc::clone(self),
            luid,
        })
    }

    pub fn contains(&self, luid: &Uuid) -> bool {
        lock(&self.verified).contains_key(luid)
    }

    /// Address of the peer currently holding `luid`.
    pub fn peer_for(&self, luid: &Uuid) -> Option<PeerAddress> {
        lock(&self.verified).get(luid).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.verified).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live entry in the [`PeerRegistry`]; removed on drop.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<PeerRegistry>,
    luid: Uuid,
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.registry.verified).remove(&self.luid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_changes_luid() {
        let id = LocalIdentity::new();
        let before = id.current();
        let after = id.rotate();
        assert_ne!(before, after);
        assert_eq!(id.current(), after);
        assert_eq!(id.rotations(), 1);
    }

    #[test]
    fn rotate_on_drop() {
        let id = Arc::new(LocalIdentity::with_luid(Uuid::nil()));
        {
            let _guard = RotateOnDrop::new(id.clone());
            assert_eq!(id.current(), Uuid::nil());
        }
        assert_ne!(id.current(), Uuid::nil());
    }

    #[test]
    fn duplicate_registration_refused() {
        let registry = Arc::new(PeerRegistry::new());
        let luid = Uuid::new_v4();
        let first = registry.register(luid, PeerAddress::from("a"));
        assert!(first.is_some());
        assert!(registry.register(luid, PeerAddress::from("b")).is_none());
        assert_eq!(registry.peer_for(&luid), Some(PeerAddress::from("a")));
    }

    #[test]
    fn registration_released_on_drop() {
        let registry = Arc::new(PeerRegistry::new());
        let luid = Uuid::new_v4();
        let reg = registry.register(luid, PeerAddress::from("a")).unwrap();
        assert!(registry.contains(&luid));
        drop(reg);
        assert!(registry.is_empty());
        assert!(registry.register(luid, PeerAddress::from("b")).is_some());
    }
}
