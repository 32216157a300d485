//! Aria: deterministic batched execution with a pessimistic fallback
//!
//! Transactions are processed in batches of `batch_size`. Within a batch:
//!
//! 1. **Execute** — every transaction runs once against a snapshot view of
//!    the table, buffering reads and writes locally.
//! 2. **Reserve** — every transaction registers itself in the per-key
//!    reservation table; each slot converges to the smallest reader and
//!    writer id of the batch.
//! 3. **Verify** — raw/war/waw analysis against the reservations decides
//!    who commits. With reordering enabled a transaction aborts iff
//!    `waw ∨ (raw ∧ war)`; otherwise iff `waw ∨ war`.
//! 4. **Commit** — survivors install their buffered writes.
//!
//! Aborted transactions re-run inside the same batch through the
//! lock-dependency fallback: each registers on the keys it touched, waits
//! for the largest smaller-id dependency to commit, then executes directly
//! against the live table. Workers synchronize on a completion barrier
//! whose action resets the shared batch-slot cursor; batch slots are
//! claimed dynamically with `fetch_add`.

use crate::affinity::pin_round_robin;
use optex_core::{
    ConfigError, CompletionBarrier, Protocol, Statistics, StorageKey, TxId, Word,
};
use optex_storage::ShardedTable;
use optex_vm::{TxHandle, VmKind, Workload};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Commit marker other fallback transactions wait on
pub struct AriaSignal {
    id: TxId,
    committed: AtomicBool,
}

impl AriaSignal {
    fn new(id: TxId) -> Self {
        AriaSignal {
            id,
            committed: AtomicBool::new(false),
        }
    }

    /// Transaction id
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Whether the transaction has committed (directly or via fallback)
    pub fn committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    fn mark_committed(&self) {
        self.committed.store(true, Ordering::SeqCst);
    }
}

/// Reservation entry for one key
///
/// Reservation slots are valid only for the batch recorded next to them;
/// observing a different batch id lazily resets the slot under the
/// partition lock, which is what lets the table survive across batches
/// without a global sweep.
#[derive(Default)]
pub struct AriaEntry {
    value: Word,
    batch_id_get: u64,
    batch_id_put: u64,
    reserved_get: Option<TxId>,
    reserved_put: Option<TxId>,
}

/// Shared table: live values plus per-batch read/write reservations
pub struct AriaTable {
    inner: ShardedTable<StorageKey, AriaEntry>,
}

impl AriaTable {
    /// Table with `partitions` independent partitions
    pub fn new(partitions: usize) -> Self {
        AriaTable {
            inner: ShardedTable::new(partitions),
        }
    }

    /// Live committed value of `key`
    pub fn value(&self, key: &StorageKey) -> Word {
        self.inner.get(key, |entry| entry.value).unwrap_or_default()
    }

    /// Install a committed value
    pub fn write(&self, key: &StorageKey, value: Word) {
        self.inner.put(*key, |entry| entry.value = value);
    }

    /// Record `tx` as a reader of `key`; the slot keeps the smallest id
    /// seen in `batch`
    pub fn reserve_get(&self, tx: TxId, batch: u64, key: &StorageKey) {
        self.inner.put(*key, |entry| {
            if entry.batch_id_get != batch {
                entry.reserved_get = None;
                entry.batch_id_get = batch;
            }
            if entry.reserved_get.map_or(true, |holder| holder > tx) {
                entry.reserved_get = Some(tx);
                tracing::trace!(tx, batch, "reserve get");
            }
        });
    }

    /// Record `tx` as a writer of `key`; the slot keeps the smallest id
    /// seen in `batch`
    pub fn reserve_put(&self, tx: TxId, batch: u64, key: &StorageKey) {
        self.inner.put(*key, |entry| {
            if entry.batch_id_put != batch {
                entry.reserved_put = None;
                entry.batch_id_put = batch;
            }
            if entry.reserved_put.map_or(true, |holder| holder > tx) {
                entry.reserved_put = Some(tx);
                tracing::trace!(tx, batch, "reserve put");
            }
        });
    }

    /// Whether `tx` holds (or nobody holds) the read reservation of `key`
    /// for `batch`
    pub fn compare_reserved_get(&self, tx: TxId, batch: u64, key: &StorageKey) -> bool {
        self.inner
            .get(key, |entry| {
                entry.batch_id_get == batch
                    && entry.reserved_get.map_or(true, |holder| holder == tx)
            })
            .unwrap_or(true)
    }

    /// Whether `tx` holds (or nobody holds) the write reservation of `key`
    /// for `batch`
    pub fn compare_reserved_put(&self, tx: TxId, batch: u64, key: &StorageKey) -> bool {
        self.inner
            .get(key, |entry| {
                entry.batch_id_put == batch
                    && entry.reserved_put.map_or(true, |holder| holder == tx)
            })
            .unwrap_or(true)
    }
}

/// Dependency lists for the fallback path of one key
#[derive(Default)]
pub struct AriaLockEntry {
    deps_get: Vec<Arc<AriaSignal>>,
    deps_put: Vec<Arc<AriaSignal>>,
}

/// Lock-dependency table: which aborted transactions touched which key
pub struct AriaLockTable {
    inner: ShardedTable<StorageKey, AriaLockEntry>,
}

impl AriaLockTable {
    /// Table with `partitions` independent partitions
    pub fn new(partitions: usize) -> Self {
        AriaLockTable {
            inner: ShardedTable::new(partitions),
        }
    }

    fn register_get(&self, signal: &Arc<AriaSignal>, key: &StorageKey) {
        self.inner
            .put(*key, |entry| entry.deps_get.push(Arc::clone(signal)));
    }

    fn register_put(&self, signal: &Arc<AriaSignal>, key: &StorageKey) {
        self.inner
            .put(*key, |entry| entry.deps_put.push(Arc::clone(signal)));
    }

    fn deregister(&self, id: TxId, key: &StorageKey) {
        self.inner.put(*key, |entry| {
            entry.deps_get.retain(|signal| signal.id != id);
            entry.deps_put.retain(|signal| signal.id != id);
        });
    }
}

struct AriaLocal {
    gets: Mutex<FxHashMap<StorageKey, Word>>,
    puts: Mutex<FxHashMap<StorageKey, Word>>,
}

struct AriaTx {
    handle: TxHandle,
    signal: Arc<AriaSignal>,
    batch_id: u64,
    flag_conflict: bool,
    local: Arc<AriaLocal>,
    start_time: Instant,
}

impl AriaTx {
    fn id(&self) -> TxId {
        self.signal.id
    }
}

struct AriaShared {
    workload: Arc<dyn Workload>,
    statistics: Arc<Statistics>,
    table: Arc<AriaTable>,
    lock_table: Arc<AriaLockTable>,
    batch: Vec<Mutex<Option<Box<AriaTx>>>>,
    cursor: Arc<AtomicUsize>,
    tx_counter: AtomicU64,
    has_conflict: AtomicBool,
    stop_flag: Arc<AtomicBool>,
    /// Shutdown decision latched by the barrier's completion action, so
    /// every worker of a cycle agrees whether another batch starts. A raw
    /// `stop_flag` read at the loop top could split the workers and strand
    /// part of them at the next barrier.
    exit_latch: Arc<AtomicBool>,
    confirm_exit: AtomicUsize,
    barrier: CompletionBarrier,
    batch_size: usize,
    num_threads: usize,
    enable_reordering: bool,
}

/// The Aria protocol engine
pub struct Aria {
    shared: Arc<AriaShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Aria {
    /// Validate options and build the engine
    pub fn new(
        workload: Arc<dyn Workload>,
        statistics: Arc<Statistics>,
        num_threads: usize,
        table_partitions: usize,
        batch_size: usize,
        enable_reordering: bool,
    ) -> Result<Self, ConfigError> {
        ConfigError::require_positive("num_threads", num_threads)?;
        ConfigError::require_positive("table_partitions", table_partitions)?;
        ConfigError::require_positive("batch_size", batch_size)?;
        if table_partitions <= num_threads {
            tracing::warn!(
                table_partitions,
                num_threads,
                "table_partitions should exceed num_threads to reduce contention"
            );
        }
        tracing::info!(
            num_threads,
            table_partitions,
            batch_size,
            enable_reordering,
            "aria"
        );
        // The fallback restarts transactions from scratch, so snapshots are
        // never taken on this path.
        workload.set_vm_kind(VmKind::Basic);
        let cursor = Arc::new(AtomicUsize::new(0));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let exit_latch = Arc::new(AtomicBool::new(false));
        let barrier = {
            let cursor = Arc::clone(&cursor);
            let stop_flag = Arc::clone(&stop_flag);
            let exit_latch = Arc::clone(&exit_latch);
            CompletionBarrier::with_completion(num_threads, move || {
                cursor.store(0, Ordering::SeqCst);
                exit_latch.store(stop_flag.load(Ordering::SeqCst), Ordering::SeqCst);
            })
        };
        Ok(Aria {
            shared: Arc::new(AriaShared {
                workload,
                statistics,
                table: Arc::new(AriaTable::new(table_partitions)),
                lock_table: Arc::new(AriaLockTable::new(table_partitions)),
                batch: (0..batch_size).map(|_| Mutex::new(None)).collect(),
                cursor,
                tx_counter: AtomicU64::new(1),
                has_conflict: AtomicBool::new(false),
                stop_flag,
                exit_latch,
                confirm_exit: AtomicUsize::new(0),
                barrier,
                batch_size,
                num_threads,
                enable_reordering,
            }),
            workers: Vec::new(),
        })
    }

    /// Live committed value of `key`
    pub fn committed_value(&self, key: &StorageKey) -> Word {
        self.shared.table.value(key)
    }

    /// Number of transactions generated so far
    pub fn generated(&self) -> u64 {
        self.shared.tx_counter.load(Ordering::SeqCst) - 1
    }
}

impl Protocol for Aria {
    fn start(&mut self) {
        self.shared.stop_flag.store(false, Ordering::SeqCst);
        self.shared.exit_latch.store(false, Ordering::SeqCst);
        self.shared.confirm_exit.store(0, Ordering::SeqCst);
        for i in 0..self.shared.num_threads {
            let shared = Arc::clone(&self.shared);
            let worker = std::thread::Builder::new()
                .name(format!("aria-{i}"))
                .spawn(move || {
                    pin_round_robin(i);
                    AriaWorker { shared }.run();
                })
                .expect("failed to spawn aria worker");
            self.workers.push(worker);
        }
    }

    fn stop(&mut self) {
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        // No worker may be mid-phase when stop returns.
        while self.shared.confirm_exit.load(Ordering::SeqCst) < self.shared.num_threads {
            std::thread::yield_now();
        }
        for worker in self.workers.drain(..) {
            worker.join().expect("aria worker panicked");
        }
    }
}

struct AriaWorker {
    shared: Arc<AriaShared>,
}

impl AriaWorker {
    fn run(self) {
        let shared = &self.shared;
        loop {
            // Phase 1: generate lazily and execute against the snapshot.
            self.for_each_slot(|slot| {
                let tx = slot.get_or_insert_with(|| Self::next_transaction(shared));
                Self::execute(shared, tx);
                shared.statistics.journal_execute();
            });
            shared.barrier.wait();

            // Phase 2: register reservations.
            self.for_each_slot(|slot| {
                let tx = slot.as_mut().expect("slot filled in execute phase");
                Self::reserve(shared, tx);
            });
            shared.barrier.wait();

            // Phase 3 + 4: verify, then commit the clean transactions.
            self.for_each_slot(|slot| {
                let tx = slot.as_mut().expect("slot filled in execute phase");
                Self::verify(shared, tx);
                if tx.flag_conflict {
                    shared.has_conflict.store(true, Ordering::SeqCst);
                } else {
                    Self::commit(shared, tx);
                    let latency = tx.start_time.elapsed().as_micros() as u64;
                    shared.statistics.journal_commit(latency);
                }
            });
            shared.barrier.wait();

            if shared.has_conflict.load(Ordering::SeqCst) {
                self.for_each_slot(|slot| {
                    let tx = slot.as_mut().expect("slot filled in execute phase");
                    if tx.flag_conflict {
                        Self::prepare_lock_table(shared, tx);
                    }
                });
                shared.barrier.wait();

                self.for_each_slot(|slot| {
                    let tx = slot.as_mut().expect("slot filled in execute phase");
                    if tx.flag_conflict {
                        Self::fallback(shared, tx);
                        shared.statistics.journal_execute();
                        let latency = tx.start_time.elapsed().as_micros() as u64;
                        shared.statistics.journal_commit(latency);
                    }
                });
                shared.barrier.wait();

                self.for_each_slot(|slot| {
                    let tx = slot.as_mut().expect("slot filled in execute phase");
                    if tx.flag_conflict {
                        Self::clean_lock_table(shared, tx);
                    }
                });
                shared.barrier.wait();
            }

            // Recycle the batch.
            self.for_each_slot(|slot| {
                *slot = None;
            });
            let leader = shared.barrier.wait();
            if leader {
                shared.has_conflict.store(false, Ordering::SeqCst);
            }
            if shared.exit_latch.load(Ordering::SeqCst) {
                break;
            }
        }
        shared.confirm_exit.fetch_add(1, Ordering::SeqCst);
    }

    /// Claim batch slots dynamically until the cursor runs past the batch.
    /// The barrier's completion action resets the cursor for the next
    /// phase.
    fn for_each_slot(&self, mut f: impl FnMut(&mut Option<Box<AriaTx>>)) {
        loop {
            let index = self.shared.cursor.fetch_add(1, Ordering::SeqCst);
            if index >= self.shared.batch_size {
                break;
            }
            let mut slot = self.shared.batch[index].lock();
            f(&mut slot);
        }
    }

    fn next_transaction(shared: &Arc<AriaShared>) -> Box<AriaTx> {
        let id = shared.tx_counter.fetch_add(1, Ordering::SeqCst);
        let batch_id = (id - 1) / shared.batch_size as u64;
        tracing::debug!(id, batch_id, "aria generate");
        Box::new(AriaTx {
            handle: shared.workload.next(),
            signal: Arc::new(AriaSignal::new(id)),
            batch_id,
            flag_conflict: false,
            local: Arc::new(AriaLocal {
                gets: Mutex::new(FxHashMap::default()),
                puts: Mutex::new(FxHashMap::default()),
            }),
            start_time: Instant::now(),
        })
    }

    /// Phase 1: run once with buffering handlers. Reads resolve from the
    /// local write set, then the local read set, then the shared table.
    fn execute(shared: &Arc<AriaShared>, tx: &mut AriaTx) {
        {
            let table = Arc::clone(&shared.table);
            let local = Arc::clone(&tx.local);
            tx.handle.install_get_handler(Box::new(move |_vm, key| {
                if let Some(value) = local.puts.lock().get(key) {
                    return *value;
                }
                if let Some(value) = local.gets.lock().get(key) {
                    return *value;
                }
                let value = table.value(key);
                local.gets.lock().insert(*key, value);
                value
            }));
        }
        {
            let local = Arc::clone(&tx.local);
            tx.handle.install_set_handler(Box::new(move |_vm, key, value| {
                local.puts.lock().insert(*key, value);
            }));
        }
        let status = tx.handle.execute();
        tracing::debug!(id = tx.id(), ?status, "aria execute");
    }

    /// Phase 2
    fn reserve(shared: &Arc<AriaShared>, tx: &AriaTx) {
        for key in tx.local.gets.lock().keys() {
            shared.table.reserve_get(tx.id(), tx.batch_id, key);
        }
        for key in tx.local.puts.lock().keys() {
            shared.table.reserve_put(tx.id(), tx.batch_id, key);
        }
    }

    /// Phase 3: raw/war/waw analysis against the converged reservations
    fn verify(shared: &Arc<AriaShared>, tx: &mut AriaTx) {
        let gets: Vec<StorageKey> = tx.local.gets.lock().keys().copied().collect();
        let puts: Vec<StorageKey> = tx.local.puts.lock().keys().copied().collect();
        let raw = gets
            .iter()
            .any(|key| !shared.table.compare_reserved_put(tx.id(), tx.batch_id, key));
        let war = puts
            .iter()
            .any(|key| !shared.table.compare_reserved_get(tx.id(), tx.batch_id, key));
        let waw = puts
            .iter()
            .any(|key| !shared.table.compare_reserved_put(tx.id(), tx.batch_id, key));
        tx.flag_conflict = if shared.enable_reordering {
            // Reordering serializes non-minimal readers before writers,
            // collapsing WAR-only conflicts.
            waw || (raw && war)
        } else {
            waw || war
        };
        tracing::debug!(
            id = tx.id(),
            raw,
            war,
            waw,
            conflict = tx.flag_conflict,
            "aria verify"
        );
    }

    /// Phase 4
    fn commit(shared: &Arc<AriaShared>, tx: &AriaTx) {
        for (key, value) in tx.local.puts.lock().iter() {
            shared.table.write(key, *value);
        }
        tx.signal.mark_committed();
    }

    fn prepare_lock_table(shared: &Arc<AriaShared>, tx: &AriaTx) {
        for key in tx.local.gets.lock().keys() {
            shared.lock_table.register_get(&tx.signal, key);
        }
        for key in tx.local.puts.lock().keys() {
            shared.lock_table.register_put(&tx.signal, key);
        }
    }

    /// Pessimistic re-execution: wait for the largest smaller-id
    /// dependency to commit, then run against the live table directly.
    fn fallback(shared: &Arc<AriaShared>, tx: &mut AriaTx) {
        let my_id = tx.id();
        let mut should_wait: Option<Arc<AriaSignal>> = None;
        {
            let mut consider = |signal: &Arc<AriaSignal>| {
                if signal.id < my_id
                    && should_wait.as_ref().map_or(true, |cur| signal.id > cur.id)
                {
                    should_wait = Some(Arc::clone(signal));
                }
            };
            for key in tx.local.puts.lock().keys() {
                shared.lock_table.inner.get(key, |entry| {
                    for signal in &entry.deps_get {
                        consider(signal);
                    }
                    for signal in &entry.deps_put {
                        consider(signal);
                    }
                });
            }
            for key in tx.local.gets.lock().keys() {
                shared.lock_table.inner.get(key, |entry| {
                    for signal in &entry.deps_put {
                        consider(signal);
                    }
                });
            }
        }
        if let Some(dependency) = &should_wait {
            tracing::debug!(id = my_id, waits_on = dependency.id, "aria fallback wait");
            while !dependency.committed() {
                std::thread::yield_now();
            }
        }

        // Re-run from scratch with no local buffers: reads and writes go
        // straight to the live table.
        {
            let table = Arc::clone(&shared.table);
            tx.handle
                .install_get_handler(Box::new(move |_vm, key| table.value(key)));
        }
        {
            let table = Arc::clone(&shared.table);
            tx.handle
                .install_set_handler(Box::new(move |_vm, key, value| table.write(key, value)));
        }
        tx.handle.apply_checkpoint(0);
        let status = tx.handle.execute();
        tracing::debug!(id = my_id, ?status, "aria fallback execute");
        tx.signal.mark_committed();
    }

    fn clean_lock_table(shared: &Arc<AriaShared>, tx: &AriaTx) {
        for key in tx.local.gets.lock().keys() {
            shared.lock_table.deregister(tx.id(), key);
        }
        for key in tx.local.puts.lock().keys() {
            shared.lock_table.deregister(tx.id(), key);
        }
    }
}
