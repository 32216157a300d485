//! Storage primitive for the optex engine
//!
//! A single export: [`ShardedTable`], the hash-partitioned map with
//! per-partition mutexes that every engine-level table is built on.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod sharded;

pub use sharded::ShardedTable;

#[cfg(test)]
mod thread_safety {
    use super::*;
    use optex_core::{StorageKey, Word};
    use static_assertions::assert_impl_all;

    assert_impl_all!(ShardedTable<StorageKey, Word>: Send, Sync);
}
