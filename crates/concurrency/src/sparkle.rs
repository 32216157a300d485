//! Sparkle: speculative concurrency control with whole-transaction rerun
//!
//! Workers draw transactions from a per-worker min-id queue (generating a
//! fresh one when the queue is empty), execute them optimistically against
//! the multi-version table, and finalize strictly in id order: a
//! transaction commits only when `last_finalized + 1` equals its id and no
//! abort signal is pending. A stale read aborts the whole transaction,
//! which rolls every read and write back and restarts from scratch.
//!
//! The write path takes a per-key write-lock slot before journaling each
//! write; the slot prefers smaller ids and displaced holders are aborted,
//! which keeps racy concurrent writers to one key from ping-ponging.

use crate::affinity::pin_round_robin;
use crate::mv::{MvTable, RerunSignal};
use optex_core::{
    ConfigError, CompletionBarrier, HasTxId, Protocol, Statistics, StorageKey, TxId, TxQueue, Word,
};
use optex_vm::{TxHandle, VmKind, Workload};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Abort signal of a Sparkle transaction: a single rerun flag.
///
/// The owning worker polls and clears it; other workers fire it through
/// the multi-version table when their writes shadow a read.
pub struct SparkleSignal {
    id: TxId,
    rerun: AtomicBool,
}

impl SparkleSignal {
    /// Signal for transaction `id`
    pub fn new(id: TxId) -> Self {
        SparkleSignal {
            id,
            rerun: AtomicBool::new(false),
        }
    }

    /// Whether a rerun is pending
    pub fn has_rerun(&self) -> bool {
        self.rerun.load(Ordering::SeqCst)
    }

    /// Acknowledge the signal before re-executing
    pub fn clear_rerun(&self) {
        self.rerun.store(false, Ordering::SeqCst);
    }
}

impl RerunSignal for SparkleSignal {
    fn id(&self) -> TxId {
        self.id
    }

    fn set_rerun(&self, _key: &StorageKey, _cause: TxId) {
        self.rerun.store(true, Ordering::SeqCst);
    }
}

/// Multi-version table specialized to Sparkle's monolithic abort flag
pub type SparkleTable = MvTable<SparkleSignal>;

#[derive(Clone, Copy)]
struct ReadRecord {
    key: StorageKey,
    value: Word,
    version: TxId,
}

#[derive(Clone, Copy)]
struct WriteRecord {
    key: StorageKey,
    value: Word,
}

/// Read/write journal shared between the installed handlers and the engine
#[derive(Default)]
struct SparkleJournal {
    gets: Mutex<Vec<ReadRecord>>,
    puts: Mutex<Vec<WriteRecord>>,
}

struct SparkleTx {
    handle: TxHandle,
    signal: Arc<SparkleSignal>,
    journal: Arc<SparkleJournal>,
    start_time: Instant,
    berun: bool,
    execution_count: u64,
}

impl SparkleTx {
    fn id(&self) -> TxId {
        self.signal.id
    }
}

impl HasTxId for SparkleTx {
    fn tx_id(&self) -> TxId {
        self.signal.id
    }
}

struct SparkleShared {
    workload: Arc<dyn Workload>,
    statistics: Arc<Statistics>,
    table: Arc<SparkleTable>,
    last_executed: AtomicU64,
    last_finalized: AtomicU64,
    stop_flag: AtomicBool,
    stop_latch: CompletionBarrier,
}

/// The Sparkle protocol engine
pub struct Sparkle {
    shared: Arc<SparkleShared>,
    num_executors: usize,
    workers: Vec<JoinHandle<()>>,
}

impl Sparkle {
    /// Validate options and build the engine.
    ///
    /// The workload is switched to the restart-only interpreter backend:
    /// Sparkle only ever rolls back to the beginning of a transaction.
    pub fn new(
        workload: Arc<dyn Workload>,
        statistics: Arc<Statistics>,
        num_executors: usize,
        table_partitions: usize,
    ) -> Result<Self, ConfigError> {
        ConfigError::require_positive("num_executors", num_executors)?;
        ConfigError::require_positive("table_partitions", table_partitions)?;
        if table_partitions <= num_executors {
            tracing::warn!(
                table_partitions,
                num_executors,
                "table_partitions should exceed num_executors to reduce contention"
            );
        }
        tracing::info!(num_executors, table_partitions, "sparkle");
        workload.set_vm_kind(VmKind::Basic);
        Ok(Sparkle {
            shared: Arc::new(SparkleShared {
                workload,
                statistics,
                table: Arc::new(SparkleTable::new(table_partitions)),
                last_executed: AtomicU64::new(1),
                last_finalized: AtomicU64::new(0),
                stop_flag: AtomicBool::new(false),
                stop_latch: CompletionBarrier::new(num_executors),
            }),
            num_executors,
            workers: Vec::new(),
        })
    }

    /// Id of the newest finalized transaction
    pub fn last_finalized(&self) -> TxId {
        self.shared.last_finalized.load(Ordering::SeqCst)
    }

    /// Finalized value of `key`: the newest version at or below
    /// [`Self::last_finalized`]
    pub fn committed_value(&self, key: &StorageKey) -> Word {
        self.shared.table.snapshot_at(key, self.last_finalized()).0
    }
}

impl Protocol for Sparkle {
    fn start(&mut self) {
        self.shared.stop_flag.store(false, Ordering::SeqCst);
        for i in 0..self.num_executors {
            let shared = Arc::clone(&self.shared);
            let worker = std::thread::Builder::new()
                .name(format!("sparkle-{i}"))
                .spawn(move || {
                    pin_round_robin(i);
                    SparkleWorker::new(shared).run();
                })
                .expect("failed to spawn sparkle worker");
            self.workers.push(worker);
        }
    }

    fn stop(&mut self) {
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            worker.join().expect("sparkle worker panicked");
        }
    }
}

struct SparkleWorker {
    shared: Arc<SparkleShared>,
    queue: TxQueue<SparkleTx>,
}

impl SparkleWorker {
    fn new(shared: Arc<SparkleShared>) -> Self {
        SparkleWorker {
            shared,
            queue: TxQueue::new(),
        }
    }

    fn run(mut self) {
        while !self.shared.stop_flag.load(Ordering::SeqCst) {
            let mut tx = self.schedule();
            if !tx.berun {
                Self::execute(&self.shared, &mut tx);
                if tx.signal.has_rerun() {
                    // Deferred: smaller-id work in the queue goes first.
                    self.queue.push(tx);
                    continue;
                }
            }
            if tx.signal.has_rerun() {
                Self::re_execute(&self.shared, &mut tx);
            }
            if !tx.signal.has_rerun()
                && self.shared.last_finalized.load(Ordering::SeqCst) + 1 == tx.id()
            {
                Self::finalize(&self.shared, tx);
            } else {
                std::thread::yield_now();
                self.queue.push(tx);
            }
        }
        self.shared.stop_latch.wait();
    }

    /// Pop the smallest queued transaction, or generate a fresh one with
    /// its handlers installed
    fn schedule(&mut self) -> Box<SparkleTx> {
        if let Some(tx) = self.queue.pop() {
            return tx;
        }
        let id = self.shared.last_executed.fetch_add(1, Ordering::SeqCst);
        let mut handle = self.shared.workload.next();
        let signal = Arc::new(SparkleSignal::new(id));
        let journal = Arc::new(SparkleJournal::default());
        {
            let table = Arc::clone(&self.shared.table);
            let signal = Arc::clone(&signal);
            let journal = Arc::clone(&journal);
            handle.install_set_handler(Box::new(move |vm, key, value| {
                table.lock(&signal, key);
                journal.puts.lock().push(WriteRecord { key: *key, value });
                if signal.has_rerun() {
                    vm.request_break();
                }
            }));
        }
        {
            let table = Arc::clone(&self.shared.table);
            let signal = Arc::clone(&signal);
            let journal = Arc::clone(&journal);
            handle.install_get_handler(Box::new(move |vm, key| {
                // Own writes win, then cached reads; the table registers at
                // most one read per key per execution.
                if let Some(record) = journal.puts.lock().iter().rev().find(|r| r.key == *key) {
                    return record.value;
                }
                if let Some(record) = journal.gets.lock().iter().find(|r| r.key == *key) {
                    return record.value;
                }
                let (value, version) = table.get(&signal, key);
                journal.gets.lock().push(ReadRecord {
                    key: *key,
                    value,
                    version,
                });
                if signal.has_rerun() {
                    vm.request_break();
                }
                value
            }));
        }
        tracing::debug!(id, "sparkle generate");
        Box::new(SparkleTx {
            handle,
            signal,
            journal,
            start_time: Instant::now(),
            berun: false,
            execution_count: 0,
        })
    }

    /// First execution attempt
    fn execute(shared: &Arc<SparkleShared>, tx: &mut SparkleTx) {
        tx.berun = true;
        tx.execution_count += 1;
        let status = tx.handle.execute();
        tracing::debug!(id = tx.id(), ?status, "sparkle execute");
        shared.statistics.journal_execute();
        Self::publish(shared, tx);
    }

    /// Release write locks, then install the journaled writes as versions.
    /// Publication stops early once an abort signal is observed.
    fn publish(shared: &Arc<SparkleShared>, tx: &SparkleTx) {
        let puts: Vec<WriteRecord> = tx.journal.puts.lock().clone();
        for record in &puts {
            shared.table.unlock(&tx.signal, &record.key);
        }
        for record in &puts {
            if tx.signal.has_rerun() {
                break;
            }
            shared.table.put(&tx.signal, &record.key, record.value);
        }
    }

    /// Roll everything back and run the transaction again from scratch
    fn re_execute(shared: &Arc<SparkleShared>, tx: &mut SparkleTx) {
        tracing::debug!(id = tx.id(), "sparkle re-execute");
        tx.signal.clear_rerun();
        tx.handle.apply_checkpoint(0);
        let gets: Vec<ReadRecord> = std::mem::take(&mut *tx.journal.gets.lock());
        let puts: Vec<WriteRecord> = std::mem::take(&mut *tx.journal.puts.lock());
        for record in &gets {
            shared.table.regret_get(&tx.signal, &record.key, record.version);
        }
        for record in &puts {
            shared.table.regret_put(&tx.signal, &record.key);
            shared.table.unlock(&tx.signal, &record.key);
        }
        tx.execution_count += 1;
        let status = tx.handle.execute();
        tracing::debug!(id = tx.id(), ?status, "sparkle re-executed");
        shared.statistics.journal_execute();
        Self::publish(shared, tx);
    }

    /// Advance `last_finalized`, sweep the journal out of the table, and
    /// journal the commit latency
    fn finalize(shared: &Arc<SparkleShared>, tx: Box<SparkleTx>) {
        tracing::debug!(id = tx.id(), count = tx.execution_count, "sparkle finalize");
        shared.last_finalized.fetch_add(1, Ordering::SeqCst);
        let gets = tx.journal.gets.lock().clone();
        let puts = tx.journal.puts.lock().clone();
        for record in &gets {
            shared.table.clear_get(&tx.signal, &record.key, record.version);
        }
        for record in &puts {
            shared.table.clear_put(&tx.signal, &record.key);
        }
        let latency = tx.start_time.elapsed().as_micros() as u64;
        shared.statistics.journal_commit(latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optex_vm::{Program, ScriptWorkload};
    use std::time::Duration;

    fn key(b: u8) -> StorageKey {
        StorageKey::from_low_bytes(b, 0)
    }

    #[test]
    fn constructor_rejects_zero_options() {
        let workload = Arc::new(ScriptWorkload::new(vec![Program::increment(key(1), 1)]));
        let stats = Arc::new(Statistics::new());
        assert!(Sparkle::new(Arc::clone(&workload), Arc::clone(&stats), 0, 8).is_err());
        assert!(Sparkle::new(workload, stats, 2, 0).is_err());
    }

    #[test]
    fn signal_set_and_clear() {
        let signal = SparkleSignal::new(3);
        assert!(!signal.has_rerun());
        signal.set_rerun(&key(1), 1);
        assert!(signal.has_rerun());
        signal.clear_rerun();
        assert!(!signal.has_rerun());
    }

    #[test]
    fn contended_counter_stays_serializable() {
        // Every transaction increments the same key by one. After any run,
        // the finalized value must equal the number of finalized
        // transactions: lost updates or stale reads would break this.
        let k = key(1);
        let workload = Arc::new(ScriptWorkload::new(vec![Program::increment(k, 1)]));
        let stats = Arc::new(Statistics::new());
        let mut sparkle =
            Sparkle::new(workload, Arc::clone(&stats), 4, 32).expect("valid options");
        sparkle.start();
        std::thread::sleep(Duration::from_millis(200));
        sparkle.stop();

        let finalized = sparkle.last_finalized();
        assert!(finalized > 0, "no transaction finalized");
        assert_eq!(stats.commits(), finalized);
        assert_eq!(sparkle.committed_value(&k).to_u64(), finalized);
        assert!(stats.executions() >= stats.commits());
    }

    #[test]
    fn disjoint_workload_finalizes_everything_it_commits() {
        let programs: Vec<Program> = (0..8)
            .map(|i| Program::increment(key(i), 1))
            .collect();
        let workload = Arc::new(ScriptWorkload::new(programs));
        let stats = Arc::new(Statistics::new());
        let mut sparkle =
            Sparkle::new(workload, Arc::clone(&stats), 4, 32).expect("valid options");
        sparkle.start();
        std::thread::sleep(Duration::from_millis(100));
        sparkle.stop();

        let finalized = sparkle.last_finalized();
        assert_eq!(stats.commits(), finalized);
        // Transaction n (1-based) increments key((n - 1) % 8): the finalized
        // counters must partition `finalized` exactly.
        let total: u64 = (0..8)
            .map(|i| sparkle.committed_value(&key(i)).to_u64())
            .sum();
        assert_eq!(total, finalized);
    }
}
