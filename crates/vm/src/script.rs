//! Deterministic scripted interpreter
//!
//! A small stack machine over storage words. It exists so the engines have
//! a collaborator that honors the full [`Vm`] contract — break between
//! instructions, checkpoint, restore — without dragging a bytecode
//! interpreter into the repo. Tests and benches drive every protocol
//! through it.
//!
//! Arithmetic operates on the trailing 8 bytes of a word, big-endian and
//! wrapping; the engines never look at word contents, so nothing outside
//! this module depends on that convention.

use crate::{CheckpointId, Host, Vm, VmControl, VmKind, VmStatus};
use optex_core::{StorageKey, Word};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// One scripted instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOp {
    /// Push a constant
    Push(Word),
    /// Read a storage key and push the value
    Load(StorageKey),
    /// Pop a value and write it to a storage key
    Store(StorageKey),
    /// Pop two values, push their wrapping sum
    Add,
    /// Duplicate the top of the stack
    Dup,
    /// Discard the top of the stack
    Pop,
    /// Fault deterministically
    Revert,
}

/// An immutable instruction sequence, cheap to clone
#[derive(Debug, Clone)]
pub struct Program {
    ops: Arc<Vec<ScriptOp>>,
}

impl Program {
    /// Program from an explicit op list
    pub fn new(ops: Vec<ScriptOp>) -> Self {
        Program { ops: Arc::new(ops) }
    }

    /// `key += delta`
    pub fn increment(key: StorageKey, delta: u64) -> Self {
        Program::new(vec![
            ScriptOp::Load(key),
            ScriptOp::Push(Word::from_u64(delta)),
            ScriptOp::Add,
            ScriptOp::Store(key),
        ])
    }

    /// `dst = src + delta`
    pub fn propagate(src: StorageKey, dst: StorageKey, delta: u64) -> Self {
        Program::new(vec![
            ScriptOp::Load(src),
            ScriptOp::Push(Word::from_u64(delta)),
            ScriptOp::Add,
            ScriptOp::Store(dst),
        ])
    }

    /// `key = value`
    pub fn store_const(key: StorageKey, value: Word) -> Self {
        Program::new(vec![ScriptOp::Push(value), ScriptOp::Store(key)])
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the program has no instructions
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Live machine state.
///
/// The stack is behind an `Arc` so the copy-on-write backend can snapshot
/// by reference-bumping; with no outstanding snapshot `Arc::make_mut`
/// mutates in place.
#[derive(Clone)]
struct Machine {
    pc: usize,
    halted: bool,
    stack: Arc<Vec<Word>>,
}

impl Machine {
    fn initial() -> Self {
        Machine {
            pc: 0,
            halted: false,
            stack: Arc::new(Vec::new()),
        }
    }

    fn push(&mut self, value: Word) {
        Arc::make_mut(&mut self.stack).push(value);
    }

    fn pop(&mut self) -> Option<Word> {
        Arc::make_mut(&mut self.stack).pop()
    }

    fn deep_copy(&self) -> Self {
        Machine {
            pc: self.pc,
            halted: self.halted,
            stack: Arc::new((*self.stack).clone()),
        }
    }
}

/// Machine state plus checkpoint store; this is what handlers control.
///
/// The break flag lives here, outside [`Machine`], so a snapshot can never
/// capture a pending break.
struct Core {
    kind: VmKind,
    machine: Machine,
    snapshots: Vec<Machine>,
    will_break: bool,
}

impl VmControl for Core {
    fn make_checkpoint(&mut self) -> CheckpointId {
        match self.kind {
            VmKind::Basic => 0,
            VmKind::Strawman => {
                self.snapshots.push(self.machine.deep_copy());
                self.snapshots.len() - 1
            }
            VmKind::CopyOnWrite => {
                self.snapshots.push(self.machine.clone());
                self.snapshots.len() - 1
            }
        }
    }

    fn request_break(&mut self) {
        self.will_break = true;
    }
}

/// Scripted interpreter instance
pub struct ScriptVm {
    program: Program,
    core: Core,
}

impl ScriptVm {
    /// Fresh instance at the start of `program`
    pub fn new(program: Program, kind: VmKind) -> Self {
        ScriptVm {
            program,
            core: Core {
                kind,
                machine: Machine::initial(),
                snapshots: Vec::new(),
                will_break: false,
            },
        }
    }

    fn fault(&mut self, reason: &'static str) -> VmStatus {
        tracing::debug!(pc = self.core.machine.pc, reason, "script fault");
        self.core.machine.halted = true;
        VmStatus::Reverted
    }
}

impl Vm for ScriptVm {
    fn execute(&mut self, host: &mut dyn Host) -> VmStatus {
        loop {
            if self.core.will_break {
                self.core.will_break = false;
                return VmStatus::Break;
            }
            if self.core.machine.halted {
                return VmStatus::Halted;
            }
            let op = match self.program.ops.get(self.core.machine.pc) {
                Some(op) => *op,
                None => {
                    self.core.machine.halted = true;
                    return VmStatus::Halted;
                }
            };
            match op {
                ScriptOp::Push(value) => {
                    self.core.machine.push(value);
                    self.core.machine.pc += 1;
                }
                ScriptOp::Load(key) => {
                    // The handler may checkpoint here: the machine still
                    // points at the load and the value is not yet on the
                    // stack, so restoring that snapshot re-issues the read.
                    let value = host.get_storage(&mut self.core, &key);
                    self.core.machine.push(value);
                    self.core.machine.pc += 1;
                }
                ScriptOp::Store(key) => {
                    let Some(value) = self.core.machine.pop() else {
                        return self.fault("stack underflow");
                    };
                    host.set_storage(&mut self.core, &key, value);
                    self.core.machine.pc += 1;
                }
                ScriptOp::Add => {
                    let (Some(b), Some(a)) = (self.core.machine.pop(), self.core.machine.pop())
                    else {
                        return self.fault("stack underflow");
                    };
                    self.core
                        .machine
                        .push(Word::from_u64(a.to_u64().wrapping_add(b.to_u64())));
                    self.core.machine.pc += 1;
                }
                ScriptOp::Dup => {
                    let Some(top) = self.core.machine.stack.last().copied() else {
                        return self.fault("stack underflow");
                    };
                    self.core.machine.push(top);
                    self.core.machine.pc += 1;
                }
                ScriptOp::Pop => {
                    if self.core.machine.pop().is_none() {
                        return self.fault("stack underflow");
                    }
                    self.core.machine.pc += 1;
                }
                ScriptOp::Revert => {
                    self.core.machine.halted = true;
                    return VmStatus::Reverted;
                }
            }
        }
    }

    fn request_break(&mut self) {
        self.core.will_break = true;
    }

    fn make_checkpoint(&mut self) -> CheckpointId {
        self.core.make_checkpoint()
    }

    fn apply_checkpoint(&mut self, id: CheckpointId) {
        match self.core.kind {
            VmKind::Basic => {
                self.core.machine = Machine::initial();
            }
            VmKind::Strawman => {
                assert!(id < self.core.snapshots.len(), "unknown checkpoint {id}");
                self.core.snapshots.truncate(id + 1);
                self.core.machine = self.core.snapshots[id].deep_copy();
            }
            VmKind::CopyOnWrite => {
                assert!(id < self.core.snapshots.len(), "unknown checkpoint {id}");
                self.core.snapshots.truncate(id + 1);
                self.core.machine = self.core.snapshots[id].clone();
            }
        }
    }
}

/// Trivial sequential host over a plain map
///
/// The serial-execution oracle used by tests: running the same programs
/// through a `MapHost` yields the storage state a correct engine must
/// converge to.
#[derive(Default)]
pub struct MapHost {
    /// Backing storage; absent keys read as zero
    pub storage: FxHashMap<StorageKey, Word>,
}

impl MapHost {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`, zero if never written
    pub fn value(&self, key: &StorageKey) -> Word {
        self.storage.get(key).copied().unwrap_or_default()
    }
}

impl Host for MapHost {
    fn get_storage(&mut self, _vm: &mut dyn VmControl, key: &StorageKey) -> Word {
        self.value(key)
    }

    fn set_storage(&mut self, _vm: &mut dyn VmControl, key: &StorageKey, value: Word) {
        self.storage.insert(*key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> StorageKey {
        StorageKey::from_low_bytes(b, 0)
    }

    #[test]
    fn increment_program_against_map_host() {
        let mut host = MapHost::new();
        host.storage.insert(key(1), Word::from_u64(40));
        let mut vm = ScriptVm::new(Program::increment(key(1), 2), VmKind::Basic);
        assert_eq!(vm.execute(&mut host), VmStatus::Halted);
        assert_eq!(host.value(&key(1)).to_u64(), 42);
    }

    #[test]
    fn revert_is_terminal() {
        let mut host = MapHost::new();
        let mut vm = ScriptVm::new(
            Program::new(vec![ScriptOp::Push(Word::ZERO), ScriptOp::Revert]),
            VmKind::Basic,
        );
        assert_eq!(vm.execute(&mut host), VmStatus::Reverted);
        assert_eq!(vm.execute(&mut host), VmStatus::Halted);
    }

    #[test]
    fn stack_underflow_faults() {
        let mut host = MapHost::new();
        let mut vm = ScriptVm::new(Program::new(vec![ScriptOp::Add]), VmKind::Basic);
        assert_eq!(vm.execute(&mut host), VmStatus::Reverted);
    }

    #[test]
    fn basic_apply_checkpoint_restarts_from_scratch() {
        struct CountingHost {
            reads: usize,
        }
        impl Host for CountingHost {
            fn get_storage(&mut self, vm: &mut dyn VmControl, _key: &StorageKey) -> Word {
                self.reads += 1;
                if self.reads == 1 {
                    vm.request_break();
                }
                Word::ZERO
            }
            fn set_storage(&mut self, _vm: &mut dyn VmControl, _key: &StorageKey, _value: Word) {}
        }

        let program = Program::new(vec![ScriptOp::Load(key(1)), ScriptOp::Store(key(2))]);
        let mut vm = ScriptVm::new(program, VmKind::Basic);
        let mut host = CountingHost { reads: 0 };
        assert_eq!(vm.execute(&mut host), VmStatus::Break);
        vm.apply_checkpoint(0);
        assert_eq!(vm.execute(&mut host), VmStatus::Halted);
        // The read ran again after the restart.
        assert_eq!(host.reads, 2);
    }

    /// Host that checkpoints at every read, the way the Spectrum engine does.
    struct CheckpointingHost {
        storage: FxHashMap<StorageKey, Word>,
        checkpoints: Vec<CheckpointId>,
        reads: Vec<StorageKey>,
    }

    impl CheckpointingHost {
        fn new() -> Self {
            CheckpointingHost {
                storage: FxHashMap::default(),
                checkpoints: Vec::new(),
                reads: Vec::new(),
            }
        }
    }

    impl Host for CheckpointingHost {
        fn get_storage(&mut self, vm: &mut dyn VmControl, key: &StorageKey) -> Word {
            let value = self.storage.get(key).copied().unwrap_or_default();
            self.checkpoints.push(vm.make_checkpoint());
            self.reads.push(*key);
            value
        }
        fn set_storage(&mut self, _vm: &mut dyn VmControl, key: &StorageKey, value: Word) {
            self.storage.insert(*key, value);
        }
    }

    fn two_read_program() -> Program {
        // c = a + b, then d = a + b + 1
        Program::new(vec![
            ScriptOp::Load(key(1)),
            ScriptOp::Load(key(2)),
            ScriptOp::Add,
            ScriptOp::Dup,
            ScriptOp::Store(key(3)),
            ScriptOp::Push(Word::from_u64(1)),
            ScriptOp::Add,
            ScriptOp::Store(key(4)),
        ])
    }

    fn rollback_resumes_from_restored_read(kind: VmKind) {
        let mut vm = ScriptVm::new(two_read_program(), kind);
        let mut host = CheckpointingHost::new();
        host.storage.insert(key(1), Word::from_u64(10));
        host.storage.insert(key(2), Word::from_u64(20));
        assert_eq!(vm.execute(&mut host), VmStatus::Halted);
        assert_eq!(host.checkpoints, vec![0, 1]);
        assert_eq!(host.storage[&key(3)].to_u64(), 30);

        // The second read becomes stale: roll back to its checkpoint and
        // re-run. Only the second read is re-issued.
        host.storage.insert(key(2), Word::from_u64(25));
        vm.apply_checkpoint(1);
        assert_eq!(vm.execute(&mut host), VmStatus::Halted);
        assert_eq!(host.reads, vec![key(1), key(2), key(2)]);
        assert_eq!(host.storage[&key(3)].to_u64(), 35);
        assert_eq!(host.storage[&key(4)].to_u64(), 36);
    }

    #[test]
    fn strawman_rollback_resumes_from_restored_read() {
        rollback_resumes_from_restored_read(VmKind::Strawman);
    }

    #[test]
    fn copy_on_write_rollback_resumes_from_restored_read() {
        rollback_resumes_from_restored_read(VmKind::CopyOnWrite);
    }

    #[test]
    fn apply_checkpoint_discards_later_snapshots() {
        let mut vm = ScriptVm::new(two_read_program(), VmKind::CopyOnWrite);
        let mut host = CheckpointingHost::new();
        assert_eq!(vm.execute(&mut host), VmStatus::Halted);
        assert_eq!(host.checkpoints, vec![0, 1]);
        vm.apply_checkpoint(0);
        // The snapshot taken after the restore reuses the discarded slot.
        assert_eq!(vm.make_checkpoint(), 1);
    }

    #[test]
    fn strawman_and_copy_on_write_agree() {
        let run = |kind: VmKind| {
            let mut vm = ScriptVm::new(two_read_program(), kind);
            let mut host = CheckpointingHost::new();
            host.storage.insert(key(1), Word::from_u64(7));
            assert_eq!(vm.execute(&mut host), VmStatus::Halted);
            host.storage.insert(key(1), Word::from_u64(9));
            vm.apply_checkpoint(0);
            assert_eq!(vm.execute(&mut host), VmStatus::Halted);
            (host.storage[&key(3)], host.storage[&key(4)])
        };
        assert_eq!(run(VmKind::Strawman), run(VmKind::CopyOnWrite));
    }
}
