//! Core types and primitives for the optex engine
//!
//! This crate defines the foundations shared by every other crate:
//! - Storage keys and 32-byte words ([`types`])
//! - Configuration errors ([`error`])
//! - The statistics sink engines report into ([`stats`])
//! - The completion barrier and the min-id work queue ([`sync`], [`queue`])
//! - The [`Protocol`] start/stop lifecycle trait

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod protocol;
pub mod queue;
pub mod stats;
pub mod sync;
pub mod types;

pub use error::{ConfigError, Result};
pub use protocol::Protocol;
pub use queue::{HasTxId, TxQueue};
pub use stats::Statistics;
pub use sync::CompletionBarrier;
pub use types::{Address, StorageKey, TxId, Word, GENESIS};

#[cfg(test)]
mod thread_safety {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Statistics: Send, Sync);
    assert_impl_all!(CompletionBarrier: Send, Sync);
    assert_impl_all!(StorageKey: Send, Sync, Copy);
}
