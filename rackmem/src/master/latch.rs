//! The per-page reader/writer latch.
//!
//! Unlike a scoped lock, a latch is taken in one RPC (`latchRemotePage`)
//! and released in another (`unLatch*`), so it exposes explicit
//! lock/unlock operations instead of guards. Waiters yield cooperatively.
//!
//! State machine: `Idle → Shared(n) → Idle` or `Idle → Exclusive → Idle`.
//! There is no shared-to-exclusive upgrade; a writer waits for all readers
//! to drain.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

const WRITER: u32 = 1 << 31;

pub struct PageLatch {
    state: AtomicU32,
}

impl Default for PageLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl PageLatch {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Acquire exclusively.
    pub fn lock(&self) {
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            thread::yield_now();
        }
    }

    /// Acquire shared.
    pub fn lock_shared(&self) {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s & WRITER != 0 {
                thread::yield_now();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(s, s + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn unlock(&self) {
        let prev = self.state.swap(0, Ordering::Release);
        debug_assert_eq!(prev, WRITER, "unlock of a latch not held exclusively");
    }

    pub fn unlock_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != 0 && prev & WRITER == 0, "unlock_shared of a latch not held shared");
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) != 0
    }
}
