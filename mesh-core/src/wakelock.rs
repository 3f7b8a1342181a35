//! Device-wide wake lock held while any session is in flight.

use std::sync::{Arc, Mutex, MutexGuard};

/// Platform hook keeping the device awake (a foreground service, a
/// systemd inhibitor). Acquire and release are always paired.
pub trait WakeLock: Send + Sync + 'static {
    fn acquire(&self);
    fn release(&self);
}

/// For hosts with nothing to keep awake.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

/// Counts sessions in flight and drives the wake lock on the 0 -> 1 and 1 -> 0
/// edges. The count and the lock call change together under one mutex.
pub struct WakeGate {
    lock: Arc<dyn WakeLock>,
    in_flight: Mutex<usize>,
}

impl WakeGate {
    pub fn new(lock: Arc<dyn WakeLock>) -> Arc<Self> {
        Arc::new(Self {
            lock,
            in_flight: Mutex::new(0),
        })
    }

    fn count(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register one more session; the returned guard unregisters it.
    pub fn enter(self: &Arc<Self>) -> InFlight {
        let mut n = self.count();
        if *n == 0 {
            self.lock.acquire();
        }
        *n += 1;
        InFlight {
            gate: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.count()
    }
}

impl std::fmt::Debug for WakeGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeGate")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[derive(Debug)]
pub struct InFlight {
    gate: Arc<WakeGate>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut n = self.gate.count();
        *n -= 1;
        if *n == 0 {
            self.gate.lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl WakeLock for Counting {
        fn acquire(&self) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn lock_held_only_while_sessions_in_flight() {
        let lock = Arc::new(Counting::default());
        let gate = WakeGate::new(lock.clone());
        let a = gate.enter();
        let b = gate.enter();
        assert_eq!(gate.in_flight(), 2);
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 1);
        drop(a);
        assert_eq!(lock.released.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
        assert_eq!(gate.in_flight(), 0);

        let _c = gate.enter();
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 2);
    }
}
