//! Hash-partitioned map with per-partition mutexes
//!
//! [`ShardedTable`] is the storage primitive every table in the engine is
//! built on: the multi-version tables, the Aria reservation table, and the
//! Aria lock-dependency table are all `ShardedTable`s with different value
//! types.
//!
//! # Design
//!
//! - A fixed number of partitions, chosen at construction. Keys map to a
//!   partition by `FxHasher(key) % partitions`.
//! - Each partition is an `FxHashMap` behind its own `parking_lot::Mutex`;
//!   partitions never contend with each other.
//! - Access is callback-based: the closure runs under the partition lock,
//!   so a read-modify-write of one entry is atomic without any per-entry
//!   locking.
//!
//! # Callback contract
//!
//! Callbacks must be short and must not touch the same table again: the
//! partition lock is held for the whole callback and re-entry on the same
//! partition deadlocks.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};

/// Hash-partitioned `K → V` map
///
/// `V` must be `Default`: `put` materializes a default value for a missing
/// key before running the callback, which is how every table entry in the
/// engine comes into existence.
pub struct ShardedTable<K, V> {
    partitions: Vec<Mutex<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq, V: Default> ShardedTable<K, V> {
    /// Create a table with `partitions` independent partitions
    ///
    /// # Panics
    ///
    /// Panics if `partitions` is zero. Protocol constructors validate the
    /// option before any table is built.
    pub fn new(partitions: usize) -> Self {
        assert!(partitions > 0, "table requires at least one partition");
        ShardedTable {
            partitions: (0..partitions).map(|_| Mutex::new(FxHashMap::default())).collect(),
        }
    }

    /// Number of partitions
    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    fn partition_of(&self, key: &K) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.partitions.len()
    }

    /// Run `f` on the value under `key` if present, under the partition lock.
    ///
    /// Returns `None` without invoking `f` when the key is absent.
    pub fn get<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        let index = self.partition_of(key);
        tracing::trace!(partition = index, "table get");
        let partition = self.partitions[index].lock();
        partition.get(key).map(f)
    }

    /// Run `f` on the value under `key`, default-constructing it if absent.
    ///
    /// The partition lock is held for the whole callback.
    pub fn put<R>(&self, key: K, f: impl FnOnce(&mut V) -> R) -> R {
        let index = self.partition_of(&key);
        tracing::trace!(partition = index, "table put");
        let mut partition = self.partitions[index].lock();
        f(partition.entry(key).or_default())
    }
}
