//! Spectrum: speculative concurrency control with partial rollback
//!
//! Same scheduling and finalization discipline as Sparkle, with one
//! difference in the abort path: a stale read does not restart the whole
//! transaction. Each read records the checkpoint taken immediately before
//! the value was surfaced to the interpreter, plus the length of the write
//! journal at that point. When abort signals arrive, the engine rolls back
//! exactly to the earliest invalidated read — withdrawing only the reads
//! and published writes after it — and resumes from that checkpoint.

use crate::affinity::pin_round_robin;
use crate::mv::{MvTable, RerunSignal};
use optex_core::{
    ConfigError, CompletionBarrier, HasTxId, Protocol, Statistics, StorageKey, TxId, TxQueue, Word,
};
use optex_vm::{CheckpointId, TxHandle, VmKind, Workload};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

type RerunKeys = SmallVec<[StorageKey; 4]>;

#[derive(Default)]
struct WarState {
    rerun_keys: RerunKeys,
    should_wait: TxId,
}

/// Abort signal of a Spectrum transaction.
///
/// Writers record the specific key that went stale so the owner can pick a
/// rollback target; `should_wait` keeps the largest causing writer id as a
/// fence.
pub struct SpectrumSignal {
    id: TxId,
    war: Mutex<WarState>,
}

impl SpectrumSignal {
    /// Signal for transaction `id`
    pub fn new(id: TxId) -> Self {
        SpectrumSignal {
            id,
            war: Mutex::new(WarState::default()),
        }
    }

    /// Whether any rerun key is pending
    pub fn has_war(&self) -> bool {
        !self.war.lock().rerun_keys.is_empty()
    }

    /// Drain the pending rerun keys, leaving the fence in place
    pub fn take_rerun_keys(&self) -> RerunKeys {
        std::mem::take(&mut self.war.lock().rerun_keys)
    }

    /// Largest writer id that caused a rerun entry
    pub fn should_wait(&self) -> TxId {
        self.war.lock().should_wait
    }
}

impl RerunSignal for SpectrumSignal {
    fn id(&self) -> TxId {
        self.id
    }

    fn set_rerun(&self, key: &StorageKey, cause: TxId) {
        let mut war = self.war.lock();
        war.rerun_keys.push(*key);
        war.should_wait = war.should_wait.max(cause);
    }
}

/// Multi-version table specialized to Spectrum's per-key WAR signal
pub type SpectrumTable = MvTable<SpectrumSignal>;

#[derive(Clone, Copy)]
struct ReadRecord {
    key: StorageKey,
    value: Word,
    version: TxId,
    /// Write-journal length when this read happened; rollback regrets only
    /// published writes at or past this index
    puts_len: usize,
    /// Snapshot taken before the interpreter observed the value
    checkpoint: CheckpointId,
}

#[derive(Clone, Copy)]
struct WriteRecord {
    key: StorageKey,
    value: Word,
    committed: bool,
}

#[derive(Default)]
struct SpectrumJournal {
    gets: Mutex<Vec<ReadRecord>>,
    puts: Mutex<Vec<WriteRecord>>,
}

struct SpectrumTx {
    handle: TxHandle,
    signal: Arc<SpectrumSignal>,
    journal: Arc<SpectrumJournal>,
    start_time: Instant,
    berun: bool,
    execution_count: u64,
}

impl SpectrumTx {
    fn id(&self) -> TxId {
        self.signal.id
    }
}

impl HasTxId for SpectrumTx {
    fn tx_id(&self) -> TxId {
        self.signal.id
    }
}

/// Index of the earliest read whose key appears in `rerun_keys`, if any.
///
/// This is the rollback target: everything before it is still valid.
fn rollback_target(gets: &[ReadRecord], rerun_keys: &[StorageKey]) -> Option<usize> {
    let mut target = None;
    for key in rerun_keys {
        for (i, record) in gets.iter().enumerate() {
            if record.key == *key {
                target = Some(target.map_or(i, |t: usize| t.min(i)));
                break;
            }
        }
    }
    target
}

struct SpectrumShared {
    workload: Arc<dyn Workload>,
    statistics: Arc<Statistics>,
    table: Arc<SpectrumTable>,
    last_executed: AtomicU64,
    last_finalized: AtomicU64,
    stop_flag: AtomicBool,
    stop_latch: CompletionBarrier,
}

/// The Spectrum protocol engine
pub struct Spectrum {
    shared: Arc<SpectrumShared>,
    num_executors: usize,
    workers: Vec<JoinHandle<()>>,
}

impl Spectrum {
    /// Validate options and build the engine
    pub fn new(
        workload: Arc<dyn Workload>,
        statistics: Arc<Statistics>,
        num_executors: usize,
        table_partitions: usize,
        vm_kind: VmKind,
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
        tracing::info!(num_executors, table_partitions, ?vm_kind, "spectrum");
        workload.set_vm_kind(vm_kind);
        Ok(Spectrum {
            shared: Arc::new(SpectrumShared {
                workload,
                statistics,
                table: Arc::new(SpectrumTable::new(table_partitions)),
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

impl Protocol for Spectrum {
    fn start(&mut self) {
        self.shared.stop_flag.store(false, Ordering::SeqCst);
        for i in 0..self.num_executors {
            let shared = Arc::clone(&self.shared);
            let worker = std::thread::Builder::new()
                .name(format!("spectrum-{i}"))
                .spawn(move || {
                    pin_round_robin(i);
                    SpectrumWorker::new(shared).run();
                })
                .expect("failed to spawn spectrum worker");
            self.workers.push(worker);
        }
    }

    fn stop(&mut self) {
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            worker.join().expect("spectrum worker panicked");
        }
    }
}

struct SpectrumWorker {
    shared: Arc<SpectrumShared>,
    queue: TxQueue<SpectrumTx>,
}

impl SpectrumWorker {
    fn new(shared: Arc<SpectrumShared>) -> Self {
        SpectrumWorker {
            shared,
            queue: TxQueue::new(),
        }
    }

    fn run(mut self) {
        while !self.shared.stop_flag.load(Ordering::SeqCst) {
            let mut tx = self.schedule();
            if !tx.berun {
                Self::execute(&self.shared, &mut tx);
                if tx.signal.has_war() {
                    self.queue.push(tx);
                    continue;
                }
            }
            if tx.signal.has_war() {
                Self::re_execute(&self.shared, &mut tx);
            }
            if !tx.signal.has_war()
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

    fn schedule(&mut self) -> Box<SpectrumTx> {
        if let Some(tx) = self.queue.pop() {
            return tx;
        }
        let id = self.shared.last_executed.fetch_add(1, Ordering::SeqCst);
        let mut handle = self.shared.workload.next();
        let signal = Arc::new(SpectrumSignal::new(id));
        let journal = Arc::new(SpectrumJournal::default());
        {
            let signal = Arc::clone(&signal);
            let journal = Arc::clone(&journal);
            handle.install_set_handler(Box::new(move |vm, key, value| {
                journal.puts.lock().push(WriteRecord {
                    key: *key,
                    value,
                    committed: false,
                });
                if signal.has_war() {
                    vm.request_break();
                }
            }));
        }
        {
            let table = Arc::clone(&self.shared.table);
            let signal = Arc::clone(&signal);
            let journal = Arc::clone(&journal);
            handle.install_get_handler(Box::new(move |vm, key| {
                if let Some(record) = journal.puts.lock().iter().rev().find(|r| r.key == *key) {
                    return record.value;
                }
                if let Some(record) = journal.gets.lock().iter().find(|r| r.key == *key) {
                    return record.value;
                }
                let (value, version) = table.get(&signal, key);
                let puts_len = journal.puts.lock().len();
                // The checkpoint must come after the table read (so
                // restoring it re-issues the read) and before the break
                // check (a pending break must never be part of the
                // snapshot).
                let checkpoint = vm.make_checkpoint();
                journal.gets.lock().push(ReadRecord {
                    key: *key,
                    value,
                    version,
                    puts_len,
                    checkpoint,
                });
                if signal.has_war() {
                    vm.request_break();
                }
                value
            }));
        }
        tracing::debug!(id, "spectrum generate");
        Box::new(SpectrumTx {
            handle,
            signal,
            journal,
            start_time: Instant::now(),
            berun: false,
            execution_count: 0,
        })
    }

    fn execute(shared: &Arc<SpectrumShared>, tx: &mut SpectrumTx) {
        tx.berun = true;
        tx.execution_count += 1;
        let status = tx.handle.execute();
        tracing::debug!(id = tx.id(), ?status, "spectrum execute");
        shared.statistics.journal_execute();
        Self::publish(shared, tx);
    }

    /// Publish journaled writes that are not yet in the table, marking each
    /// as committed; stops early once an abort signal is observed
    fn publish(shared: &Arc<SpectrumShared>, tx: &SpectrumTx) {
        let mut puts = tx.journal.puts.lock();
        for record in puts.iter_mut() {
            if tx.signal.has_war() {
                break;
            }
            if record.committed {
                continue;
            }
            shared.table.put(&tx.signal, &record.key, record.value);
            record.committed = true;
        }
    }

    /// Partial rollback: restore the checkpoint of the earliest invalidated
    /// read, withdraw everything after it, and resume
    fn re_execute(shared: &Arc<SpectrumShared>, tx: &mut SpectrumTx) {
        let rerun_keys = tx.signal.take_rerun_keys();
        let target = rollback_target(&tx.journal.gets.lock(), &rerun_keys);
        let Some(back_to) = target else {
            // The invalidated reads were already rolled back by an earlier
            // pass; just resume and publish whatever completes.
            tracing::debug!(id = tx.id(), "spectrum resume without rollback");
            tx.execution_count += 1;
            let status = tx.handle.execute();
            tracing::debug!(id = tx.id(), ?status, "spectrum resumed");
            shared.statistics.journal_execute();
            Self::publish(shared, tx);
            return;
        };
        tracing::debug!(id = tx.id(), back_to, "spectrum partial rollback");
        let anchor = tx.journal.gets.lock()[back_to];
        tx.handle.apply_checkpoint(anchor.checkpoint);
        {
            let mut puts = tx.journal.puts.lock();
            for record in puts.iter().skip(anchor.puts_len) {
                if record.committed {
                    shared.table.regret_put(&tx.signal, &record.key);
                }
            }
            puts.truncate(anchor.puts_len);
        }
        {
            let mut gets = tx.journal.gets.lock();
            for record in gets.iter().skip(back_to) {
                shared.table.regret_get(&tx.signal, &record.key, record.version);
            }
            gets.truncate(back_to);
        }
        tx.execution_count += 1;
        let status = tx.handle.execute();
        tracing::debug!(id = tx.id(), ?status, "spectrum re-executed");
        shared.statistics.journal_execute();
        Self::publish(shared, tx);
    }

    fn finalize(shared: &Arc<SpectrumShared>, tx: Box<SpectrumTx>) {
        tracing::debug!(id = tx.id(), count = tx.execution_count, "spectrum finalize");
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

    fn record(key_byte: u8, index: usize) -> ReadRecord {
        ReadRecord {
            key: key(key_byte),
            value: Word::ZERO,
            version: 0,
            puts_len: index,
            checkpoint: index,
        }
    }

    #[test]
    fn rollback_target_picks_earliest_matching_read() {
        let gets = [record(1, 0), record(2, 1), record(3, 2)];
        assert_eq!(rollback_target(&gets, &[key(3)]), Some(2));
        assert_eq!(rollback_target(&gets, &[key(3), key(2)]), Some(1));
        assert_eq!(rollback_target(&gets, &[key(2), key(1)]), Some(0));
    }

    #[test]
    fn rollback_target_is_none_for_unknown_keys() {
        let gets = [record(1, 0), record(2, 1)];
        assert_eq!(rollback_target(&gets, &[key(9)]), None);
        assert_eq!(rollback_target(&gets, &[]), None);
        assert_eq!(rollback_target(&[], &[key(1)]), None);
    }

    #[test]
    fn signal_accumulates_keys_and_fence() {
        let signal = SpectrumSignal::new(5);
        assert!(!signal.has_war());
        signal.set_rerun(&key(1), 2);
        signal.set_rerun(&key(2), 4);
        signal.set_rerun(&key(1), 3);
        assert!(signal.has_war());
        assert_eq!(signal.should_wait(), 4);
        let keys = signal.take_rerun_keys();
        assert_eq!(keys.len(), 3);
        assert!(!signal.has_war());
        // The fence survives the drain.
        assert_eq!(signal.should_wait(), 4);
    }

    #[test]
    fn constructor_rejects_zero_options() {
        let workload = Arc::new(ScriptWorkload::new(vec![Program::increment(key(1), 1)]));
        let stats = Arc::new(Statistics::new());
        assert!(
            Spectrum::new(Arc::clone(&workload), Arc::clone(&stats), 0, 8, VmKind::Strawman)
                .is_err()
        );
        assert!(Spectrum::new(workload, stats, 2, 0, VmKind::Strawman).is_err());
    }

    fn contended_run(vm_kind: VmKind) {
        use optex_vm::{MapHost, ScriptOp, ScriptVm, Vm as _, VmStatus};

        // Two table reads and two writes per transaction over hot keys, so
        // partial rollback has real work on every conflict:
        //   k0 += 1; k1 += k0
        let program = Program::new(vec![
            ScriptOp::Load(key(0)),
            ScriptOp::Push(Word::from_u64(1)),
            ScriptOp::Add,
            ScriptOp::Dup,
            ScriptOp::Store(key(0)),
            ScriptOp::Load(key(1)),
            ScriptOp::Add,
            ScriptOp::Store(key(1)),
        ]);
        let workload = Arc::new(ScriptWorkload::new(vec![program.clone()]));
        let stats = Arc::new(Statistics::new());
        let mut spectrum =
            Spectrum::new(workload, Arc::clone(&stats), 4, 32, vm_kind).expect("valid options");
        spectrum.start();
        std::thread::sleep(Duration::from_millis(200));
        spectrum.stop();

        let finalized = spectrum.last_finalized();
        assert!(finalized > 0, "no transaction finalized");
        assert_eq!(stats.commits(), finalized);

        // Serial oracle: every transaction runs the same program, so the
        // finalized prefix replays as `finalized` serial executions.
        let mut host = MapHost::new();
        for _ in 0..finalized {
            let mut vm = ScriptVm::new(program.clone(), VmKind::Basic);
            assert_eq!(vm.execute(&mut host), VmStatus::Halted);
        }
        for b in 0..2u8 {
            assert_eq!(
                spectrum.committed_value(&key(b)),
                host.value(&key(b)),
                "key {b} diverged from serial execution"
            );
        }
    }

    #[test]
    fn contended_run_is_serializable_with_strawman_checkpoints() {
        contended_run(VmKind::Strawman);
    }

    #[test]
    fn contended_run_is_serializable_with_copy_on_write_checkpoints() {
        contended_run(VmKind::CopyOnWrite);
    }
}
