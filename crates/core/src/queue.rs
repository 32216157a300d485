//! Lock-protected priority queue keyed by transaction id
//!
//! Speculative workers prefer the smallest-id transaction they own: the
//! smallest id is the next candidate for finalization, and re-executing it
//! first shortens the critical path. The queue is a min-heap on
//! [`HasTxId::tx_id`] behind a mutex.

use crate::types::TxId;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Anything with a transaction id
pub trait HasTxId {
    /// The transaction id ordering the queue
    fn tx_id(&self) -> TxId;
}

struct MinById<T>(Box<T>);

impl<T: HasTxId> PartialEq for MinById<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.tx_id() == other.0.tx_id()
    }
}

impl<T: HasTxId> Eq for MinById<T> {}

impl<T: HasTxId> PartialOrd for MinById<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: HasTxId> Ord for MinById<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap max is the smallest id.
        other.0.tx_id().cmp(&self.0.tx_id())
    }
}

/// Mutex-guarded min-id priority queue
pub struct TxQueue<T> {
    heap: Mutex<BinaryHeap<MinById<T>>>,
}

impl<T: HasTxId> TxQueue<T> {
    /// Empty queue
    pub fn new() -> Self {
        TxQueue {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Pop the transaction with the smallest id, if any
    pub fn pop(&self) -> Option<Box<T>> {
        self.heap.lock().pop().map(|item| item.0)
    }

    /// Push a transaction
    pub fn push(&self, tx: Box<T>) {
        self.heap.lock().push(MinById(tx));
    }

    /// Number of queued transactions
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

impl<T: HasTxId> Default for TxQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item(TxId);

    impl HasTxId for Item {
        fn tx_id(&self) -> TxId {
            self.0
        }
    }

    #[test]
    fn pops_smallest_id_first() {
        let queue = TxQueue::new();
        for id in [5u64, 1, 3, 2, 4] {
            queue.push(Box::new(Item(id)));
        }
        let order: Vec<TxId> = std::iter::from_fn(|| queue.pop()).map(|i| i.0).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let queue: TxQueue<Item> = TxQueue::new();
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn reinserted_smallest_wins_again() {
        let queue = TxQueue::new();
        queue.push(Box::new(Item(7)));
        queue.push(Box::new(Item(9)));
        let first = queue.pop().unwrap();
        assert_eq!(first.0, 7);
        queue.push(first);
        assert_eq!(queue.pop().unwrap().0, 7);
        assert_eq!(queue.len(), 1);
    }
}
