//! Per-key reader/writer locks with lazy creation and refcounted teardown.
//!
//! A registry hands out scoped shared/exclusive guards keyed by value. Two
//! acquisitions with equal keys collapse to the same underlying lock; the
//! lock entry is created on first acquire and reclaimed when the last guard
//! drops. A single global lock would serialize unrelated keys, and a fresh
//! lock per acquisition could not provide mutual exclusion at all; the
//! registry is the middle ground.
//!
//! Waiting is cooperative: a blocked acquirer spins with
//! `std::thread::yield_now`, so lock holders that are themselves parked on
//! RPC futures keep the rest of the system moving.

use std::hash::Hash;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use shardmap::ShardMap;

const WRITER: u32 = 1 << 31;

/// One lock entry. `state` packs a writer bit over a reader count;
/// `holders` counts guards plus in-flight acquirers and drives teardown.
struct Entry {
    state: AtomicU32,
    holders: AtomicUsize,
}

impl Entry {
    fn lock_shared(&self) {
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

    fn lock_exclusive(&self) {
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

    fn unlock_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & !WRITER > 0);
    }

    fn unlock_exclusive(&self) {
        let prev = self.state.swap(0, Ordering::Release);
        debug_assert_eq!(prev, WRITER);
    }
}

/// Registry of per-key reader/writer locks.
pub struct LockRegistry<K> {
    entries: ShardMap<K, Arc<Entry>>,
}

impl<K> Default for LockRegistry<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> LockRegistry<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: ShardMap::new(),
        }
    }

    /// Pin the entry for `key`, creating it if needed.
    ///
    /// The holder count of a dying entry (observed at 0) cannot be revived:
    /// its owner is about to erase it, so retry until a fresh insert wins.
    fn acquire_entry(&self, key: &K) -> Arc<Entry> {
        loop {
            let (entry, inserted) = self.entries.find_or_emplace(key, || {
                Arc::new(Entry {
                    state: AtomicU32::new(0),
                    holders: AtomicUsize::new(1),
                })
            });
            if inserted {
                return entry;
            }
            let pinned = entry
                .holders
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| {
                    if h == 0 {
                        None
                    } else {
                        Some(h + 1)
                    }
                })
                .is_ok();
            if pinned {
                return entry;
            }
            thread::yield_now();
        }
    }

    fn release_entry(&self, key: &K, entry: &Arc<Entry>) {
        if entry.holders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.entries.erase_if(key, |e| {
                Arc::ptr_eq(e, entry) && e.holders.load(Ordering::Acquire) == 0
            });
        }
    }

    /// Acquire the shared (reader) side of `key`'s lock.
    pub fn shared(&self, key: K) -> SharedGuard<'_, K> {
        let entry = self.acquire_entry(&key);
        entry.lock_shared();
        SharedGuard {
            registry: self,
            key,
            entry,
        }
    }

    /// Acquire the exclusive (writer) side of `key`'s lock. The writer
    /// waits for all readers to drain; there is no shared-to-exclusive
    /// upgrade.
    pub fn unique(&self, key: K) -> UniqueGuard<'_, K> {
        let entry = self.acquire_entry(&key);
        entry.lock_exclusive();
        UniqueGuard {
            registry: self,
            key,
            entry,
        }
    }

    /// Number of live lock entries (keys with at least one holder).
    pub fn live_locks(&self) -> usize {
        self.entries.len()
    }
}

pub struct SharedGuard<'a, K>
where
    K: Hash + Eq + Clone,
{
    registry: &'a LockRegistry<K>,
    key: K,
    entry: Arc<Entry>,
}

impl<K> Drop for SharedGuard<'_, K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        self.entry.unlock_shared();
        self.registry.release_entry(&self.key, &self.entry);
    }
}

pub struct UniqueGuard<'a, K>
where
    K: Hash + Eq + Clone,
{
    registry: &'a LockRegistry<K>,
    key: K,
    entry: Arc<Entry>,
}

impl<K> Drop for UniqueGuard<'_, K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        self.entry.unlock_exclusive();
        self.registry.release_entry(&self.key, &self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_shared_then_unique() {
        let reg: LockRegistry<u64> = LockRegistry::new();
        {
            let _a = reg.shared(1);
            let _b = reg.shared(1);
            assert_eq!(reg.live_locks(), 1);
        }
        {
            let _c = reg.unique(1);
        }
        assert_eq!(reg.live_locks(), 0);
    }

    #[test]
    fn test_distinct_keys_do_not_contend() {
        let reg: LockRegistry<u64> = LockRegistry::new();
        let _a = reg.unique(1);
        let _b = reg.unique(2);
        assert_eq!(reg.live_locks(), 2);
    }

    #[test]
    fn test_mutual_exclusion() {
        let reg = Arc::new(LockRegistry::<u64>::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let reg = reg.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = reg.unique(9);
                    let v = counter.load(Ordering::Relaxed);
                    thread::yield_now();
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert_eq!(reg.live_locks(), 0);
    }

    #[test]
    fn test_readers_block_writer() {
        let reg = Arc::new(LockRegistry::<u64>::new());
        let in_read = Arc::new(AtomicU64::new(1));
        let guard = reg.shared(5);

        let reg2 = reg.clone();
        let in_read2 = in_read.clone();
        let writer = thread::spawn(move || {
            let _g = reg2.unique(5);
            assert_eq!(in_read2.load(Ordering::SeqCst), 0);
        });

        // Writer cannot enter while the reader holds the lock.
        thread::sleep(std::time::Duration::from_millis(20));
        in_read.store(0, Ordering::SeqCst);
        drop(guard);
        writer.join().unwrap();
        assert_eq!(reg.live_locks(), 0);
    }

    #[test]
    fn test_entry_reclaimed_and_recreated() {
        let reg: LockRegistry<u64> = LockRegistry::new();
        drop(reg.unique(3));
        assert_eq!(reg.live_locks(), 0);
        drop(reg.shared(3));
        assert_eq!(reg.live_locks(), 0);
    }
}
