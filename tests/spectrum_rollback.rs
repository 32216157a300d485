//! Partial-rollback scenario, wired by hand the way the Spectrum engine
//! wires its transactions: t1 writes X, reads A (checkpoint cp_a), reads B
//! (checkpoint cp_b), writes C. A smaller transaction then writes A.
//! t1 must roll back to cp_a — not cp_b, and not the beginning.

use optex::{
    Address, CheckpointId, Program, ScriptOp, ScriptVm, SpectrumSignal, SpectrumTable, StorageKey,
    TxHandle, TxId, VmKind, VmStatus, Word,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

fn key(address: u8, slot: u64) -> StorageKey {
    StorageKey::new(Address::from_low_byte(address), Word::from_u64(slot))
}

#[derive(Clone, Copy)]
struct ReadRec {
    key: StorageKey,
    value: Word,
    version: TxId,
    puts_len: usize,
    checkpoint: CheckpointId,
}

#[derive(Clone, Copy)]
struct WriteRec {
    key: StorageKey,
    value: Word,
    committed: bool,
}

#[derive(Default)]
struct Journal {
    gets: Mutex<Vec<ReadRec>>,
    puts: Mutex<Vec<WriteRec>>,
    set_calls: Mutex<FxHashMap<StorageKey, usize>>,
}

fn wire(handle: &mut TxHandle, table: &Arc<SpectrumTable>, signal: &Arc<SpectrumSignal>, journal: &Arc<Journal>) {
    {
        let signal = Arc::clone(signal);
        let journal = Arc::clone(journal);
        handle.install_set_handler(Box::new(move |vm, k, value| {
            *journal.set_calls.lock().entry(*k).or_insert(0) += 1;
            journal.puts.lock().push(WriteRec {
                key: *k,
                value,
                committed: false,
            });
            if signal.has_war() {
                vm.request_break();
            }
        }));
    }
    {
        let table = Arc::clone(table);
        let signal = Arc::clone(signal);
        let journal = Arc::clone(journal);
        handle.install_get_handler(Box::new(move |vm, k| {
            if let Some(rec) = journal.puts.lock().iter().rev().find(|r| r.key == *k) {
                return rec.value;
            }
            if let Some(rec) = journal.gets.lock().iter().find(|r| r.key == *k) {
                return rec.value;
            }
            let (value, version) = table.get(&signal, k);
            let puts_len = journal.puts.lock().len();
            let checkpoint = vm.make_checkpoint();
            journal.gets.lock().push(ReadRec {
                key: *k,
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
}

fn publish(table: &Arc<SpectrumTable>, signal: &Arc<SpectrumSignal>, journal: &Arc<Journal>) {
    let mut puts = journal.puts.lock();
    for rec in puts.iter_mut() {
        if signal.has_war() {
            break;
        }
        if rec.committed {
            continue;
        }
        table.put(signal, &rec.key, rec.value);
        rec.committed = true;
    }
}

#[test]
fn rollback_targets_the_earliest_invalidated_read() {
    let x = key(1, 0);
    let a = key(1, 1);
    let b = key(2, 0);
    let c = key(2, 1);

    // t1: X = 9; C = A + B
    let program = Program::new(vec![
        ScriptOp::Push(Word::from_u64(9)),
        ScriptOp::Store(x),
        ScriptOp::Load(a),
        ScriptOp::Load(b),
        ScriptOp::Add,
        ScriptOp::Store(c),
    ]);

    let table = Arc::new(SpectrumTable::new(8));
    let t1 = Arc::new(SpectrumSignal::new(2));
    let journal = Arc::new(Journal::default());
    let mut handle = TxHandle::new(Box::new(ScriptVm::new(program, VmKind::CopyOnWrite)));
    wire(&mut handle, &table, &t1, &journal);

    assert_eq!(handle.execute(), VmStatus::Halted);
    publish(&table, &t1, &journal);
    assert_eq!(table.snapshot_at(&c, 2), (Word::ZERO, 2), "C = 0 + 0 so far");

    // A smaller transaction invalidates the read of A.
    let t0 = Arc::new(SpectrumSignal::new(1));
    table.put(&t0, &a, Word::from_u64(5));
    assert!(t1.has_war());

    // Partial rollback, exactly as the engine performs it.
    let rerun_keys = t1.take_rerun_keys();
    let back_to = {
        let gets = journal.gets.lock();
        rerun_keys
            .iter()
            .filter_map(|k| gets.iter().position(|r| r.key == *k))
            .min()
            .expect("the invalidated key was read")
    };
    assert_eq!(back_to, 0, "roll back to the read of A, not of B");

    let anchor = journal.gets.lock()[back_to];
    assert_eq!(anchor.puts_len, 1, "the write of X predates the read of A");
    handle.apply_checkpoint(anchor.checkpoint);
    {
        let mut puts = journal.puts.lock();
        for rec in puts.iter().skip(anchor.puts_len) {
            if rec.committed {
                table.regret_put(&t1, &rec.key);
            }
        }
        puts.truncate(anchor.puts_len);
    }
    {
        let mut gets = journal.gets.lock();
        for rec in gets.iter().skip(back_to) {
            table.regret_get(&t1, &rec.key, rec.version);
        }
        gets.truncate(back_to);
    }

    assert_eq!(handle.execute(), VmStatus::Halted);
    publish(&table, &t1, &journal);

    // The resumed run re-read A (now t0's value) and B, and rewrote C.
    assert_eq!(table.snapshot_at(&c, 2), (Word::from_u64(5), 2));
    let gets = journal.gets.lock();
    assert_eq!(gets.len(), 2);
    assert_eq!(gets[0].key, a);
    assert_eq!(gets[0].version, 1, "the re-read observed t0's version");
    // Code before cp_a did not run again: X was written exactly once.
    assert_eq!(journal.set_calls.lock()[&x], 1);
    assert_eq!(journal.set_calls.lock()[&c], 2);
}
