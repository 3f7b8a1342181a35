//! Channel allocator: a fixed pool of notifiable characteristics shared by all
//! concurrent sessions.
//!
//! A session holds a [`ChannelLease`] for its whole life. The lease is not
//! `Clone`, and [`ChannelLease::release`] takes it by value, so a released
//! lease can't be used again:
//!
//! ```compile_fail
//! # use mesh_core::allocator::ChannelAllocator;
//! # async fn demo() {
//! let pool = ChannelAllocator::new(1);
//! let lease = pool.acquire().await.unwrap();
//! lease.release();
//! lease.release();
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::radio::{channel_characteristic, Characteristic};

/// Pool of `N` channels. Permits track free channels; the slot table tracks which.
#[derive(Debug)]
pub struct ChannelAllocator {
    permits: Arc<Semaphore>,
    locked: Mutex<Vec<bool>>,
}

impl ChannelAllocator {
    pub fn new(channels: u8) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(channels as usize)),
            locked: Mutex::new(vec![false; channels as usize]),
        })
    }

    fn slots(&self) -> MutexGuard<'_, Vec<bool>> {
        self.locked.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    /// Channels free right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Leases currently held.
    pub fn outstanding(&self) -> usize {
        self.slots().iter().filter(|l| **l).count()
    }

    /// Wait for any channel to become free and lock it.
    pub async fn acquire(self: &Arc<Self>) -> Result<ChannelLease, AllocatorError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| AllocatorError::Closed)?;
        Ok(self.lease(permit))
    }

    /// Like [`acquire`](Self::acquire) but gives up after `bound`. A pool that
    /// stays exhausted this long has almost certainly leaked a lease.
    pub async fn acquire_within(
        self: &Arc<Self>,
        bound: Duration,
    ) -> Result<ChannelLease, AllocatorError> {
        match tokio::time::timeout(bound, self.acquire()).await {
            Ok(lease) => lease,
            Err(_) => Err(AllocatorError::Starved(bound)),
        }
    }

    /// Lock a channel only if one is free now.
    pub fn try_acquire(self: &Arc<Self>) -> Result<ChannelLease, AllocatorError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Ok(self.lease(permit)),
            Err(TryAcquireError::NoPermits) => Err(AllocatorError::Exhausted),
            Err(TryAcquireError::Closed) => Err(AllocatorError::Closed),
        }
    }

    /// Refuse all further acquisitions and wake every waiter with `Closed`.
    /// Outstanding leases stay valid until released.
    pub fn close(&self) {
        self.permits.close();
    }

    fn lease(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> ChannelLease {
        let channel_id = {
            let mut slots = self.slots();
            let Some(free) = slots.iter().position(|l| !*l) else {
                panic!("channel allocator corrupted: permit granted with every channel locked");
            };
            slots[free] = true;
            free as u8
        };
        ChannelLease {
            channel_id,
            characteristic: channel_characteristic(channel_id),
            allocator: Arc::clone(self),
            _permit: permit,
        }
    }

    fn unlock(&self, channel_id: u8) {
        let mut slots = self.slots();
        let slot = &mut slots[channel_id as usize];
        if !*slot {
            panic!("channel allocator corrupted: channel {channel_id} released twice");
        }
        *slot = false;
    }
}

/// Exclusive use of one channel. Released on [`release`](Self::release) or drop.
#[derive(Debug)]
pub struct ChannelLease {
    channel_id: u8,
    characteristic: Characteristic,
    allocator: Arc<ChannelAllocator>,
    // Dropped after `Drop::drop` unlocks the slot, so a woken waiter always finds it free.
    _permit: OwnedSemaphorePermit,
}

impl ChannelLease {
    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    pub fn characteristic(&self) -> Characteristic {
        self.characteristic
    }

    /// Give the channel back and wake one waiter.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.allocator.unlock(self.channel_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    #[error("no channel free")]
    Exhausted,
    #[error("no channel freed within {0:?}")]
    Starved(Duration),
    #[error("channel allocator closed")]
    Closed,
}
