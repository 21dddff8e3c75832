//! Wait Queue
//!
//! A mechanism for threads to sleep until an event occurs.
//!
//! The engine carries no scheduler of its own, so the queue is a generation
//! counter: a waiter snapshots the generation while it still holds the lock
//! protecting the condition it is about to wait on, drops that lock, and
//! spins until the generation moves. A notifier bumps the generation after
//! mutating the condition under the same lock, so the snapshot-then-wait
//! protocol cannot lose a wakeup. Spurious wakeups are possible and every
//! caller waits in a recheck loop.

use core::sync::atomic::{AtomicU64, Ordering};

/// A queue of waiting threads
pub struct WaitQueue {
    gen: AtomicU64,
}

impl WaitQueue {
    /// Create a new wait queue
    pub const fn new() -> Self {
        Self {
            gen: AtomicU64::new(0),
        }
    }

    /// Snapshot the current generation.
    ///
    /// Must be called before releasing the lock that guards the awaited
    /// condition, otherwise a notify between the release and the wait is
    /// lost.
    pub fn prepare(&self) -> u64 {
        self.gen.load(Ordering::Acquire)
    }

    /// Block until the generation moves past `token`.
    pub fn wait(&self, token: u64) {
        while self.gen.load(Ordering::Acquire) == token {
            core::hint::spin_loop();
        }
    }

    /// Block with a spin budget.
    /// Returns true if notified, false if the budget ran out.
    pub fn wait_budget(&self, token: u64, budget: u64) -> bool {
        let mut remaining = budget;
        while self.gen.load(Ordering::Acquire) == token {
            if remaining == 0 {
                return false;
            }
            remaining -= 1;
            core::hint::spin_loop();
        }
        true
    }

    /// Wake every waiter parked on this queue.
    pub fn notify_all(&self) {
        self.gen.fetch_add(1, Ordering::Release);
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
