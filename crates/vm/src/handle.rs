//! Transaction handle: one interpreter instance plus installed handlers
//!
//! Engines install their storage handlers once, at transaction generation,
//! and then drive the interpreter through `execute`/`apply_checkpoint` any
//! number of times. The handlers stay installed across re-executions.

use crate::{CheckpointId, Host, Vm, VmControl, VmStatus};
use optex_core::{StorageKey, Word};

/// Read handler: receives the interpreter control surface and the key
pub type GetHandler = Box<dyn FnMut(&mut dyn VmControl, &StorageKey) -> Word + Send>;

/// Write handler: receives the control surface, the key, and the value
pub type SetHandler = Box<dyn FnMut(&mut dyn VmControl, &StorageKey, Word) + Send>;

/// Opaque handle around one interpreter instance
///
/// Obtained from a [`crate::Workload`]; owned by exactly one engine worker
/// from generation through finalization.
pub struct TxHandle {
    vm: Box<dyn Vm>,
    get_handler: Option<GetHandler>,
    set_handler: Option<SetHandler>,
}

struct InstalledHandlers<'a> {
    get: &'a mut Option<GetHandler>,
    set: &'a mut Option<SetHandler>,
}

impl Host for InstalledHandlers<'_> {
    fn get_storage(&mut self, vm: &mut dyn VmControl, key: &StorageKey) -> Word {
        match self.get {
            Some(handler) => handler(vm, key),
            None => Word::ZERO,
        }
    }

    fn set_storage(&mut self, vm: &mut dyn VmControl, key: &StorageKey, value: Word) {
        if let Some(handler) = self.set {
            handler(vm, key, value);
        }
    }
}

impl TxHandle {
    /// Wrap an interpreter instance
    pub fn new(vm: Box<dyn Vm>) -> Self {
        TxHandle {
            vm,
            get_handler: None,
            set_handler: None,
        }
    }

    /// Install (or replace) the read handler
    pub fn install_get_handler(&mut self, handler: GetHandler) {
        self.get_handler = Some(handler);
    }

    /// Install (or replace) the write handler
    pub fn install_set_handler(&mut self, handler: SetHandler) {
        self.set_handler = Some(handler);
    }

    /// Run or resume the interpreter until it halts, faults, or breaks
    pub fn execute(&mut self) -> VmStatus {
        let mut host = InstalledHandlers {
            get: &mut self.get_handler,
            set: &mut self.set_handler,
        };
        self.vm.execute(&mut host)
    }

    /// Set the break flag read between instructions
    pub fn request_break(&mut self) {
        self.vm.request_break();
    }

    /// Snapshot the interpreter state
    pub fn make_checkpoint(&mut self) -> CheckpointId {
        self.vm.make_checkpoint()
    }

    /// Restore a snapshot, discarding all later snapshots
    pub fn apply_checkpoint(&mut self, id: CheckpointId) {
        self.vm.apply_checkpoint(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Program, ScriptOp, ScriptVm};
    use crate::VmKind;
    use optex_core::Word;
    use std::sync::{Arc, Mutex};

    fn key(b: u8) -> StorageKey {
        StorageKey::from_low_bytes(b, 0)
    }

    #[test]
    fn handlers_see_reads_and_writes_in_program_order() {
        let program = Program::new(vec![
            ScriptOp::Load(key(1)),
            ScriptOp::Push(Word::from_u64(5)),
            ScriptOp::Add,
            ScriptOp::Store(key(2)),
        ]);
        let mut handle = TxHandle::new(Box::new(ScriptVm::new(program, VmKind::Basic)));

        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            handle.install_get_handler(Box::new(move |_vm, k| {
                log.lock().unwrap().push(format!("get {:?}", k.address));
                Word::from_u64(10)
            }));
        }
        {
            let log = Arc::clone(&log);
            handle.install_set_handler(Box::new(move |_vm, k, v| {
                log.lock().unwrap().push(format!("set {:?}={}", k.address, v.to_u64()));
            }));
        }

        assert_eq!(handle.execute(), VmStatus::Halted);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].starts_with("get"));
        assert!(log[1].ends_with("=15"));
    }

    #[test]
    fn missing_handlers_default_reads_and_swallow_writes() {
        let program = Program::new(vec![ScriptOp::Load(key(1)), ScriptOp::Store(key(2))]);
        let mut handle = TxHandle::new(Box::new(ScriptVm::new(program, VmKind::Basic)));
        assert_eq!(handle.execute(), VmStatus::Halted);
    }

    #[test]
    fn break_from_handler_suspends_and_resumes() {
        let program = Program::new(vec![
            ScriptOp::Load(key(1)),
            ScriptOp::Store(key(2)),
            ScriptOp::Push(Word::from_u64(1)),
            ScriptOp::Store(key(3)),
        ]);
        let mut handle = TxHandle::new(Box::new(ScriptVm::new(program, VmKind::Strawman)));

        let writes = Arc::new(Mutex::new(0usize));
        {
            let writes = Arc::clone(&writes);
            handle.install_set_handler(Box::new(move |vm, _k, _v| {
                let mut writes = writes.lock().unwrap();
                *writes += 1;
                if *writes == 1 {
                    vm.request_break();
                }
            }));
        }

        assert_eq!(handle.execute(), VmStatus::Break);
        assert_eq!(*writes.lock().unwrap(), 1);
        // Re-entering the handle resumes after the instruction that broke.
        assert_eq!(handle.execute(), VmStatus::Halted);
        assert_eq!(*writes.lock().unwrap(), 2);
    }
}
