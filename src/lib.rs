//! # optex
//!
//! A concurrency-control engine for a deterministic smart-contract
//! executor. Given a stream of transactions that each run a bytecode
//! program against a shared key/value store, optex decides when each
//! transaction commits, schedules re-execution when its reads go stale,
//! and produces a serializable history whose order matches ascending
//! transaction ids.
//!
//! # Protocols
//!
//! | Protocol | Strategy | Options |
//! |----------|----------|---------|
//! | [`Sparkle`] | Speculative, whole-transaction rerun | `num_executors`, `table_partitions` |
//! | [`Spectrum`] | Speculative, partial rollback to per-read checkpoints | `num_executors`, `table_partitions`, `vm_kind` |
//! | [`Aria`] | Deterministic batches with pessimistic fallback | `num_threads`, `table_partitions`, `batch_size`, `enable_reordering` |
//!
//! # Quick start
//!
//! ```no_run
//! use optex::{Program, Protocol, ScriptWorkload, Sparkle, Statistics, StorageKey};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let counter = StorageKey::from_low_bytes(1, 0);
//! let workload = Arc::new(ScriptWorkload::new(vec![Program::increment(counter, 1)]));
//! let statistics = Arc::new(Statistics::new());
//! let mut engine = Sparkle::new(workload, Arc::clone(&statistics), 4, 32).unwrap();
//!
//! engine.start();
//! std::thread::sleep(Duration::from_secs(1));
//! engine.stop();
//!
//! println!("{}", statistics.print_with_duration(Duration::from_secs(1)));
//! ```
//!
//! # Collaborators
//!
//! The bytecode interpreter is external: engines drive it through the
//! [`Vm`]/[`TxHandle`] contract (execute, break between instructions,
//! checkpoint, restore) and draw transactions from a [`Workload`]. The
//! bundled [`ScriptVm`] is a deterministic reference implementation of
//! that contract used by the tests and benches.

pub use optex_concurrency::{
    Aria, AriaLockTable, AriaSignal, AriaTable, MvTable, RerunSignal, Sparkle, SparkleSignal,
    SparkleTable, Spectrum, SpectrumSignal, SpectrumTable,
};
pub use optex_core::{
    Address, ConfigError, Protocol, Statistics, StorageKey, TxId, Word, GENESIS,
};
pub use optex_storage::ShardedTable;
pub use optex_vm::{
    CheckpointId, Host, MapHost, Program, ScriptOp, ScriptVm, ScriptWorkload, TxHandle, Vm,
    VmControl, VmKind, VmStatus, Workload,
};
