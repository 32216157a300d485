//! Speculative multi-version table
//!
//! Maps storage keys to version lists. Every read registers the reader on
//! the version it observed; every write scans for readers that observed an
//! older version and fires their abort signal. The table is generic over
//! the signal type: the Sparkle variant collapses the signal to a single
//! rerun flag, the Spectrum variant records the offending key so rollback
//! can be partial. Nothing else differs between the two.
//!
//! # Ordering
//!
//! Version lists are strictly increasing in writer id. All scans walk from
//! the highest writer downward and stop at the first entry with
//! `writer <= tx.id`: that is the version the transaction reads, and on a
//! write it is the only version whose readers can have observed a value the
//! new write shadows.
//!
//! # Reader lifetime
//!
//! Reader sets hold `Arc` abort-signal handles keyed by transaction id. A
//! transaction removes itself from every reader set it joined — via
//! `regret_get` when it rolls a read back, via `clear_get` when it
//! finalizes — before its engine drops it.

use optex_core::{StorageKey, TxId, Word, GENESIS};
use optex_storage::ShardedTable;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Abort signal fired at a transaction whose read became stale
///
/// `set_rerun` is invoked under the partition lock by whichever worker
/// performed the invalidating write; implementations must be cheap and
/// must not touch any table.
pub trait RerunSignal: Send + Sync + 'static {
    /// Id of the transaction this signal belongs to
    fn id(&self) -> TxId;

    /// Fire the signal: `key`, written by `cause`, invalidated a read
    fn set_rerun(&self, key: &StorageKey, cause: TxId);
}

/// One version of one key
struct VersionEntry<S> {
    value: Word,
    writer: TxId,
    readers: FxHashMap<TxId, Arc<S>>,
}

/// Version list for one key
///
/// `readers_default` holds the transactions that read the genesis value
/// (version 0). `writer_lock` is the optional per-key write-lock slot used
/// by engines that serialize concurrent writers (Sparkle); engines that do
/// not lock simply never populate it.
pub struct VersionList<S> {
    writer_lock: Option<Arc<S>>,
    entries: VecDeque<VersionEntry<S>>,
    readers_default: FxHashMap<TxId, Arc<S>>,
}

impl<S> Default for VersionList<S> {
    fn default() -> Self {
        VersionList {
            writer_lock: None,
            entries: VecDeque::new(),
            readers_default: FxHashMap::default(),
        }
    }
}

/// Partitioned multi-version table over abort signals of type `S`
pub struct MvTable<S> {
    inner: ShardedTable<StorageKey, VersionList<S>>,
}

impl<S: RerunSignal> MvTable<S> {
    /// Table with `partitions` independent partitions
    pub fn new(partitions: usize) -> Self {
        MvTable {
            inner: ShardedTable::new(partitions),
        }
    }

    /// Read the newest version with `writer <= tx.id` and register `tx` as
    /// its reader. Returns the genesis `(zero, 0)` and registers `tx` in
    /// `readers_default` when no such version exists.
    pub fn get(&self, tx: &Arc<S>, key: &StorageKey) -> (Word, TxId) {
        let id = tx.id();
        self.inner.put(*key, |list| {
            for entry in list.entries.iter_mut().rev() {
                if entry.writer > id {
                    continue;
                }
                entry.readers.insert(id, Arc::clone(tx));
                tracing::trace!(reader = id, version = entry.writer, "mv get");
                return (entry.value, entry.writer);
            }
            list.readers_default.insert(id, Arc::clone(tx));
            tracing::trace!(reader = id, version = GENESIS, "mv get default");
            (Word::ZERO, GENESIS)
        })
    }

    /// Install (or overwrite) `tx`'s version of `key` and abort every
    /// reader whose observed version the new write shadows.
    ///
    /// Readers of the first entry with `writer <= tx.id` and all
    /// genesis-value readers are aborted when their id exceeds `tx.id`.
    /// The sweep over default readers is deliberately conservative: any
    /// larger-id default reader is aborted on any write.
    pub fn put(&self, tx: &Arc<S>, key: &StorageKey, value: Word) {
        let id = tx.id();
        debug_assert!(id > GENESIS, "version 0 is reserved for the default value");
        self.inner.put(*key, |list| {
            let mut shadowed = None;
            for i in (0..list.entries.len()).rev() {
                if list.entries[i].writer <= id {
                    shadowed = Some(i);
                    break;
                }
            }
            if let Some(i) = shadowed {
                for reader in list.entries[i].readers.values() {
                    if reader.id() > id {
                        tracing::trace!(writer = id, aborted = reader.id(), "mv put abort");
                        reader.set_rerun(key, id);
                    }
                }
            }
            for reader in list.readers_default.values() {
                if reader.id() > id {
                    tracing::trace!(writer = id, aborted = reader.id(), "mv put abort default");
                    reader.set_rerun(key, id);
                }
            }
            match shadowed {
                // Duplicate write by the same transaction: overwrite in place.
                Some(i) if list.entries[i].writer == id => list.entries[i].value = value,
                Some(i) => list.entries.insert(
                    i + 1,
                    VersionEntry {
                        value,
                        writer: id,
                        readers: FxHashMap::default(),
                    },
                ),
                None => list.entries.push_front(VersionEntry {
                    value,
                    writer: id,
                    readers: FxHashMap::default(),
                }),
            }
        });
    }

    /// Try to take the per-key write-lock slot.
    ///
    /// Succeeds when the slot is free or held by a transaction with a
    /// larger-or-equal id; a displaced larger incumbent is aborted. Fails
    /// (and leaves the slot untouched) when a smaller id holds it.
    pub fn lock(&self, tx: &Arc<S>, key: &StorageKey) -> bool {
        let id = tx.id();
        self.inner.put(*key, |list| {
            if let Some(holder) = &list.writer_lock {
                if holder.id() > id {
                    tracing::trace!(locker = id, displaced = holder.id(), "mv lock displace");
                    holder.set_rerun(key, id);
                }
            }
            let acquired = match &list.writer_lock {
                None => true,
                Some(holder) => holder.id() >= id,
            };
            if acquired {
                list.writer_lock = Some(Arc::clone(tx));
            }
            acquired
        })
    }

    /// Release the write-lock slot if `tx` holds it
    pub fn unlock(&self, tx: &Arc<S>, key: &StorageKey) -> bool {
        let id = tx.id();
        self.inner.put(*key, |list| {
            let held = matches!(&list.writer_lock, Some(holder) if holder.id() == id);
            if held {
                list.writer_lock = None;
            }
            held
        })
    }

    /// Withdraw a read: remove `tx` from the reader set of `version`
    /// (from `readers_default` when the version is 0)
    pub fn regret_get(&self, tx: &Arc<S>, key: &StorageKey, version: TxId) {
        let id = tx.id();
        self.inner.put(*key, |list| {
            for entry in list.entries.iter_mut() {
                if entry.writer == version {
                    entry.readers.remove(&id);
                    break;
                }
            }
            if version == GENESIS {
                list.readers_default.remove(&id);
            }
            Self::debug_assert_no_reader(list, id);
        });
    }

    /// Withdraw a write: remove `tx`'s version and abort every transaction
    /// that read it
    pub fn regret_put(&self, tx: &Arc<S>, key: &StorageKey) {
        let id = tx.id();
        self.inner.put(*key, |list| {
            let mut removed = None;
            for (i, entry) in list.entries.iter().enumerate() {
                if entry.writer == id {
                    for reader in entry.readers.values() {
                        tracing::trace!(writer = id, aborted = reader.id(), "mv regret put abort");
                        reader.set_rerun(key, id);
                    }
                    removed = Some(i);
                    break;
                }
            }
            if let Some(i) = removed {
                list.entries.remove(i);
            }
        });
    }

    /// Finalize-time sweep of a read: same removal as [`Self::regret_get`]
    pub fn clear_get(&self, tx: &Arc<S>, key: &StorageKey, version: TxId) {
        self.regret_get(tx, key, version);
    }

    /// Finalize-time sweep of a write: drop every version with
    /// `writer < tx.id`. Safe because `tx` is final, so no transaction with
    /// a smaller id remains to read them.
    pub fn clear_put(&self, tx: &Arc<S>, key: &StorageKey) {
        let id = tx.id();
        self.inner.put(*key, |list| {
            while list.entries.front().is_some_and(|entry| entry.writer < id) {
                list.entries.pop_front();
            }
        });
    }

    /// Read the newest version with `writer <= id` without registering a
    /// reader. Observation only; engines never call this on the hot path.
    pub fn snapshot_at(&self, key: &StorageKey, id: TxId) -> (Word, TxId) {
        self.inner
            .get(key, |list| {
                for entry in list.entries.iter().rev() {
                    if entry.writer <= id {
                        return (entry.value, entry.writer);
                    }
                }
                (Word::ZERO, GENESIS)
            })
            .unwrap_or((Word::ZERO, GENESIS))
    }

    fn debug_assert_no_reader(list: &VersionList<S>, id: TxId) {
        #[cfg(debug_assertions)]
        {
            for entry in list.entries.iter() {
                debug_assert!(
                    !entry.readers.contains_key(&id),
                    "reader {id} still registered on version {}",
                    entry.writer
                );
            }
            debug_assert!(
                !list.readers_default.contains_key(&id),
                "reader {id} still registered on the default value"
            );
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (list, id);
        }
    }
}
