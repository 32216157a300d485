//! Workload contract and the scripted reference workload
//!
//! A workload yields a fresh, ready-to-execute transaction handle on every
//! call. Engines select the interpreter backend through `set_vm_kind`
//! before spawning workers; `next` is called concurrently from every
//! worker afterwards.

use crate::{Program, ScriptVm, TxHandle, VmKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of transactions for an engine
pub trait Workload: Send + Sync {
    /// Yield a fresh transaction handle
    fn next(&self) -> TxHandle;

    /// Select the interpreter backend for subsequently yielded handles
    fn set_vm_kind(&self, kind: VmKind);
}

/// Round-robin workload over a fixed program list
///
/// Deterministic: the transaction yielded by the `n`-th call to `next`
/// (0-based) runs `programs[n % programs.len()]`, which is what lets tests
/// replay the same sequence serially as an oracle.
pub struct ScriptWorkload {
    programs: Vec<Program>,
    cursor: AtomicUsize,
    kind: Mutex<VmKind>,
}

impl ScriptWorkload {
    /// Workload cycling through `programs`
    ///
    /// # Panics
    ///
    /// Panics if `programs` is empty.
    pub fn new(programs: Vec<Program>) -> Self {
        assert!(!programs.is_empty(), "workload requires at least one program");
        ScriptWorkload {
            programs,
            cursor: AtomicUsize::new(0),
            kind: Mutex::new(VmKind::Strawman),
        }
    }

    /// The program the `n`-th yielded transaction runs (0-based)
    pub fn program(&self, n: usize) -> &Program {
        &self.programs[n % self.programs.len()]
    }
}

impl Workload for ScriptWorkload {
    fn next(&self) -> TxHandle {
        let n = self.cursor.fetch_add(1, Ordering::SeqCst);
        let program = self.program(n).clone();
        let kind = *self.kind.lock();
        TxHandle::new(Box::new(ScriptVm::new(program, kind)))
    }

    fn set_vm_kind(&self, kind: VmKind) {
        *self.kind.lock() = kind;
    }
}
