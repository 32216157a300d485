//! Synchronization primitives shared by the engines
//!
//! [`CompletionBarrier`] is a cyclic barrier with a completion action: the
//! last worker to arrive runs the action while every other worker is still
//! blocked, then all are released together. The Aria engine uses the action
//! to reset its batch-slot cursor between phases.

use parking_lot::{Condvar, Mutex};

struct BarrierState {
    waiting: usize,
    generation: u64,
}

/// Cyclic barrier over `n` workers with a completion action
///
/// Reusable: after all `n` workers pass, the next `n` waits form a new
/// cycle. The completion action runs exactly once per cycle, on the last
/// arriving worker's thread, before any worker is released.
pub struct CompletionBarrier {
    n: usize,
    state: Mutex<BarrierState>,
    condvar: Condvar,
    completion: Box<dyn Fn() + Send + Sync>,
}

impl CompletionBarrier {
    /// Barrier over `n` workers with a completion action
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn with_completion(n: usize, completion: impl Fn() + Send + Sync + 'static) -> Self {
        assert!(n > 0, "barrier requires at least one worker");
        CompletionBarrier {
            n,
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
            }),
            condvar: Condvar::new(),
            completion: Box::new(completion),
        }
    }

    /// Barrier over `n` workers with no completion action
    pub fn new(n: usize) -> Self {
        Self::with_completion(n, || {})
    }

    /// Block until all `n` workers have arrived.
    ///
    /// Returns `true` on the worker that ran the completion action.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        state.waiting += 1;
        if state.waiting == self.n {
            state.waiting = 0;
            state.generation = state.generation.wrapping_add(1);
            (self.completion)();
            self.condvar.notify_all();
            true
        } else {
            let generation = state.generation;
            while state.generation == generation {
                self.condvar.wait(&mut state);
            }
            false
        }
    }
}
