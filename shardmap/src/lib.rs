//! Sharded concurrent hash map.
//!
//! A map split over a fixed number of shards, each guarded by its own
//! reader/writer lock. Lookups take a shared lock on one shard only, so
//! readers of different keys proceed in parallel and writers contend only
//! within their shard.
//!
//! Values are handed out by clone. Callers that need shared mutable entries
//! store `Arc<T>` values; the clone is then a refcount bump and entry
//! identity can be checked with `Arc::ptr_eq` after racy gaps.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

use parking_lot::RwLock;
use rand::Rng;

/// Number of shards. Shard choice is `hash(key) % SHARD_COUNT`.
pub const SHARD_COUNT: usize = 32;

struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

pub struct ShardMap<K, V> {
    shards: Vec<Shard<K, V>>,
    hasher: RandomState,
}

impl<K, V> Default for ShardMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ShardMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Shard {
                map: RwLock::new(HashMap::new()),
            });
        }
        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &K) -> &Shard<K, V> {
        let idx = self.hasher.hash_one(key) as usize % SHARD_COUNT;
        &self.shards[idx]
    }

    /// Insert `value` under `key`. Returns `false` if the key was already
    /// present (the existing value is left untouched).
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut map = self.shard(&key).map.write();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, value);
        true
    }

    /// Look up `key` under a shared shard lock.
    pub fn get(&self, key: &K) -> Option<V> {
        self.shard(key).map.read().get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shard(key).map.read().contains_key(key)
    }

    /// Look up `key`; if absent, run `ctor` under the exclusive shard lock
    /// and insert its result.
    ///
    /// The lookup is optimistic: a shared probe first, then an exclusive
    /// re-check before `ctor` runs. `ctor` is invoked at most once per
    /// successful emplace; a concurrent emplace of the same key makes the
    /// loser observe the winner's value without running its own `ctor`.
    ///
    /// Returns the value and whether this call inserted it.
    pub fn find_or_emplace<F>(&self, key: &K, ctor: F) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        let shard = self.shard(key);
        if let Some(v) = shard.map.read().get(key) {
            return (v.clone(), false);
        }
        let mut map = shard.map.write();
        if let Some(v) = map.get(key) {
            return (v.clone(), false);
        }
        let v = ctor();
        map.insert(key.clone(), v.clone());
        (v, true)
    }

    /// Remove `key`, returning the value if it was present.
    pub fn erase(&self, key: &K) -> Option<V> {
        self.shard(key).map.write().remove(key)
    }

    /// Remove `key` only if `pred` holds for the current value.
    /// Returns whether an entry was removed.
    pub fn erase_if<F>(&self, key: &K, pred: F) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        let mut map = self.shard(key).map.write();
        if map.get(key).is_some_and(|v| pred(v)) {
            map.remove(key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.map.read().is_empty())
    }

    /// Visit entries shard by shard under shared locks. `f` returning
    /// `false` terminates the walk.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for shard in &self.shards {
            let map = shard.map.read();
            for (k, v) in map.iter() {
                if !f(k, v) {
                    return;
                }
            }
        }
    }

    /// Visit entries like [`for_each`](Self::for_each), starting from a
    /// uniformly random shard and wrapping around so each shard is visited
    /// exactly once.
    pub fn random_for_each<R, F>(&self, rng: &mut R, mut f: F)
    where
        R: Rng,
        F: FnMut(&K, &V) -> bool,
    {
        let start = rng.gen_range(0..SHARD_COUNT);
        for step in 0..SHARD_COUNT {
            let shard = &self.shards[(start + step) % SHARD_COUNT];
            let map = shard.map.read();
            for (k, v) in map.iter() {
                if !f(k, v) {
                    return;
                }
            }
        }
    }

    /// Collect the current keys. Snapshot semantics: concurrent mutation of
    /// other shards may or may not be observed.
    pub fn keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        self.for_each(|k, _| {
            out.push(k.clone());
            true
        });
        out
    }
}
