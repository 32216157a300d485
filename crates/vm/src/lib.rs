//! Interpreter contract and transaction handle
//!
//! The concurrency engines never interpret bytecode themselves. They drive
//! an interpreter instance through the narrow contract in this crate:
//!
//! - [`Vm`] — execute until halt or break, request a break between
//!   instructions, take and restore checkpoints.
//! - [`Host`] — the storage callbacks an executing interpreter routes every
//!   read and write through. Handlers receive a [`VmControl`] so they can
//!   checkpoint or break the interpreter mid-execution.
//! - [`TxHandle`] — wraps one interpreter instance and its installed
//!   handlers; this is the unit a [`Workload`] yields and an engine owns.
//!
//! [`VmKind`] selects between the three checkpointing backends: `Basic`
//! (restart-only), `Strawman` (deep-copy snapshots) and `CopyOnWrite`
//! (shared-state snapshots). [`script`] provides a deterministic scripted
//! interpreter implementing all three, used as the reference collaborator
//! by tests and benches.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handle;
pub mod script;
pub mod workload;

use optex_core::{StorageKey, Word};
use std::str::FromStr;
use thiserror::Error;

pub use handle::{GetHandler, SetHandler, TxHandle};
pub use script::{MapHost, Program, ScriptOp, ScriptVm};
pub use workload::{ScriptWorkload, Workload};

/// Identifier of an interpreter checkpoint
///
/// Opaque to the engines; only ever obtained from `make_checkpoint` and
/// passed back to `apply_checkpoint`. The `Basic` backend always returns 0.
pub type CheckpointId = usize;

/// Outcome of one `execute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    /// The program ran to completion
    Halted,
    /// A break was requested; `execute` may be called again to resume
    Break,
    /// The program faulted. Treated as a final local outcome, never retried
    Reverted,
}

/// Interpreter backend selection
///
/// The backends differ only in the cost and behavior of checkpointing:
/// - `Basic`: no snapshots; `apply_checkpoint` restores the pristine
///   initial state (full restart).
/// - `Strawman`: each snapshot deep-copies the machine state.
/// - `CopyOnWrite`: snapshots share state; later mutation copies only what
///   it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmKind {
    /// Restart-only backend
    Basic,
    /// Deep-copy snapshots
    Strawman,
    /// Shared-state snapshots
    CopyOnWrite,
}

/// Error parsing a [`VmKind`] from its option string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown vm kind: {0}")]
pub struct ParseVmKindError(String);

impl FromStr for VmKind {
    type Err = ParseVmKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("BASIC") {
            Ok(VmKind::Basic)
        } else if s.eq_ignore_ascii_case("STRAWMAN") {
            Ok(VmKind::Strawman)
        } else if s.eq_ignore_ascii_case("COPYONWRITE") {
            Ok(VmKind::CopyOnWrite)
        } else {
            Err(ParseVmKindError(s.to_string()))
        }
    }
}

/// Control surface an executing interpreter hands to storage handlers
///
/// Lets a handler snapshot the machine immediately before a read value is
/// surfaced, or request a break that takes effect between instructions.
pub trait VmControl {
    /// Snapshot the interpreter state; returns the snapshot's id
    fn make_checkpoint(&mut self) -> CheckpointId;

    /// Ask the interpreter to return control between instructions
    fn request_break(&mut self);
}

/// Storage callbacks invoked by an executing interpreter
pub trait Host {
    /// Resolve a storage read
    fn get_storage(&mut self, vm: &mut dyn VmControl, key: &StorageKey) -> Word;

    /// Record a storage write
    fn set_storage(&mut self, vm: &mut dyn VmControl, key: &StorageKey, value: Word);
}

/// One interpreter instance
///
/// `execute` runs (or resumes) until the program halts, faults, or a
/// requested break takes effect. After a break the same instance can be
/// re-entered by calling `execute` again.
pub trait Vm: Send {
    /// Run or resume the program, routing storage traffic through `host`
    fn execute(&mut self, host: &mut dyn Host) -> VmStatus;

    /// Set the break flag read between instructions
    fn request_break(&mut self);

    /// Snapshot the machine state
    fn make_checkpoint(&mut self) -> CheckpointId;

    /// Restore the snapshot and discard all later snapshots
    fn apply_checkpoint(&mut self, id: CheckpointId);
}
