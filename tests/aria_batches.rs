//! Aria batch behavior through the public surface: a read/write pair in
//! the same batch commits without the fallback when reordering is on, and
//! routes the writer through the fallback when it is off.

use optex::{Program, Protocol, Aria, ScriptWorkload, Statistics, StorageKey, Word};
use std::sync::Arc;
use std::time::Duration;

fn key(b: u8) -> StorageKey {
    StorageKey::from_low_bytes(b, 0)
}

/// Reader copies k into m; writer blindly sets k. One of each per batch.
fn reader_writer_workload() -> Arc<ScriptWorkload> {
    let k = key(1);
    let m = key(2);
    Arc::new(ScriptWorkload::new(vec![
        Program::propagate(k, m, 0),
        Program::store_const(k, Word::from_u64(42)),
    ]))
}

fn run_for(aria: &mut Aria, millis: u64) {
    aria.start();
    std::thread::sleep(Duration::from_millis(millis));
    aria.stop();
}

#[test]
fn reordering_collapses_war_only_conflicts() {
    let stats = Arc::new(Statistics::new());
    let mut aria =
        Aria::new(reader_writer_workload(), Arc::clone(&stats), 2, 8, 2, true).unwrap();
    run_for(&mut aria, 100);

    assert!(stats.commits() >= 2, "at least one batch must complete");
    assert_eq!(stats.commits(), aria.generated(), "every transaction commits");
    // No fallback ran: each transaction executed exactly once.
    assert_eq!(stats.executions(), stats.commits());
    assert_eq!(aria.committed_value(&key(1)), Word::from_u64(42));
}

#[test]
fn strict_mode_routes_the_writer_through_the_fallback() {
    let stats = Arc::new(Statistics::new());
    let mut aria =
        Aria::new(reader_writer_workload(), Arc::clone(&stats), 2, 8, 2, false).unwrap();
    run_for(&mut aria, 100);

    assert!(stats.commits() >= 2, "at least one batch must complete");
    assert_eq!(stats.commits(), aria.generated(), "every transaction commits");
    // The writer of every batch re-executed on the fallback path.
    assert!(
        stats.executions() > stats.commits(),
        "fallback re-executions must be journaled"
    );
    assert_eq!(aria.committed_value(&key(1)), Word::from_u64(42));
}

#[test]
fn disjoint_batches_never_conflict() {
    let programs: Vec<Program> = (0..4)
        .map(|i| Program::store_const(key(10 + i), Word::from_u64(u64::from(i))))
        .collect();
    let workload = Arc::new(ScriptWorkload::new(programs));
    let stats = Arc::new(Statistics::new());
    let mut aria = Aria::new(workload, Arc::clone(&stats), 4, 16, 4, false).unwrap();
    run_for(&mut aria, 100);

    assert_eq!(stats.commits(), aria.generated());
    assert_eq!(stats.executions(), stats.commits(), "no conflicts, no fallback");
}
