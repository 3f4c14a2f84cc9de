//! Bounded flow slot pool
//!
//! Every flow held by the [`FlowTable`](super::FlowTable) owns one
//! [`PoolSlot`]. Slots live in a lock-free `ArrayQueue` free list; when it is
//! empty, [`FlowPool::acquire`] parks on a condition variable for at most the
//! configured wait before giving up. A slot goes back to the free list when
//! its owning flow is finally dropped, which for a removed flow means after
//! the last concurrent reader has let go of it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

/// Default number of flow slots
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Fixed-capacity slot allocator
pub struct FlowPool {
    free: ArrayQueue<u32>,
    capacity: usize,
    waiters: Mutex<()>,
    released: Condvar,
    exhausted: AtomicU64,
}

impl FlowPool {
    /// Create a pool with `capacity` slots
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let free = ArrayQueue::new(capacity);
        for id in 0..capacity {
            // Cannot fail: the queue was sized for exactly `capacity` entries
            let _ = free.push(id as u32);
        }
        Arc::new(Self {
            free,
            capacity,
            waiters: Mutex::new(()),
            released: Condvar::new(),
            exhausted: AtomicU64::new(0),
        })
    }

    /// Take a slot, waiting up to `wait` if none is free
    ///
    /// The wait parks the calling thread. Control handlers call this from
    /// runtime worker threads, so only a full pool ever stalls them, and for
    /// no longer than `flows.pool_wait_ms` (50 ms by default, capped at
    /// 200 ms by config validation).
    ///
    /// Returns `None` if the pool stayed empty for the whole wait.
    pub fn acquire(self: &Arc<Self>, wait: Duration) -> Option<PoolSlot> {
        if let Some(id) = self.free.pop() {
            return Some(self.slot(id));
        }

        let deadline = Instant::now() + wait;
        let mut guard = self.waiters.lock();
        loop {
            if let Some(id) = self.free.pop() {
                return Some(self.slot(id));
            }
            if self.released.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        drop(guard);

        match self.free.pop() {
            Some(id) => Some(self.slot(id)),
            None => {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Total number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free slots
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of acquisitions that timed out
    #[must_use]
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }

    fn slot(self: &Arc<Self>, id: u32) -> PoolSlot {
        PoolSlot {
            id,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, id: u32) {
        let _ = self.free.push(id);
        // Taking the lock orders this push before any waiter's re-check
        let _guard = self.waiters.lock();
        self.released.notify_one();
    }
}

impl fmt::Debug for FlowPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A slot taken from a [`FlowPool`], returned on drop
pub struct PoolSlot {
    id: u32,
    pool: Arc<FlowPool>,
}

impl PoolSlot {
    /// Slot index
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

impl fmt::Debug for PoolSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolSlot").field(&self.id).finish()
    }
}
