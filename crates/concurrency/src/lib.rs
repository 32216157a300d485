//! Concurrency-control engines for the optex executor
//!
//! Three protocols over the shared storage primitive:
//! - [`Sparkle`] — speculative execution, whole-transaction rerun on a
//!   stale read
//! - [`Spectrum`] — speculative execution, partial rollback to the
//!   checkpoint taken at the invalidated read
//! - [`Aria`] — deterministic batches: execute / reserve / verify / commit
//!   with a pessimistic lock-dependency fallback
//!
//! The speculative engines share one multi-version table ([`mv`]); they
//! differ only in the abort-signal payload their transactions carry.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod affinity;
pub mod aria;
pub mod mv;
pub mod sparkle;
pub mod spectrum;

pub use aria::{Aria, AriaLockTable, AriaSignal, AriaTable};
pub use mv::{MvTable, RerunSignal, VersionList};
pub use sparkle::{Sparkle, SparkleSignal, SparkleTable};
pub use spectrum::{Spectrum, SpectrumSignal, SpectrumTable};

#[cfg(test)]
mod thread_safety {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(SparkleTable: Send, Sync);
    assert_impl_all!(SpectrumTable: Send, Sync);
    assert_impl_all!(AriaTable: Send, Sync);
    assert_impl_all!(Sparkle: Send);
    assert_impl_all!(Spectrum: Send);
    assert_impl_all!(Aria: Send);
}
