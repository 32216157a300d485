//! Protocol lifecycle trait
//!
//! Every engine is driven the same way: construct with validated options,
//! `start()` to spawn its workers, `stop()` to raise the stop flag and join
//! every worker. `stop()` returns only once no worker is mid-operation.

/// A runnable concurrency-control protocol
pub trait Protocol {
    /// Spawn the worker threads. Called once.
    fn start(&mut self);

    /// Signal shutdown and join every worker. Called once, after `start`.
    fn stop(&mut self);
}
