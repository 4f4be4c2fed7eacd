//! Failure Queue: holding area for writes that failed to commit
//!
//! Bulk items whose flush failed (transport error or per-item rejection) are
//! appended here and drained for resubmission once the store is reachable
//! again. Retry order is FIFO at drain time.
//!
//! By default the queue is unbounded so that nothing is lost during a long
//! outage. A capacity can be set, in which case the oldest items are dropped
//! first and counted in [`FailureQueueStats::total_dropped`].
//!
//! # Example
//!
//! ```
//! use storm_core_resilience::failure_queue::FailureQueue;
//!
//! let queue = FailureQueue::unbounded();
//! queue.append(vec!["doc-1", "doc-2"]);
//! queue.push("doc-3");
//!
//! assert_eq!(queue.len(), 3);
//! let retry = queue.drain();
//! assert_eq!(retry, vec!["doc-1", "doc-2", "doc-3"]);
//! assert!(queue.is_empty());
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    total_received: u64,
    total_dropped: u64,
}

/// Lock-guarded FIFO of failed items awaiting retry
#[derive(Debug)]
pub struct FailureQueue<T> {
    inner: Mutex<QueueInner<T>>,
    max_capacity: Option<usize>,
}

impl<T> FailureQueue<T> {
    /// Create a queue, optionally capped at `max_capacity` items
    pub fn new(max_capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                total_received: 0,
                total_dropped: 0,
            }),
            max_capacity,
        }
    }

    /// Create a queue with no capacity bound
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a single failed item
    pub fn push(&self, item: T) {
        self.append(std::iter::once(item));
    }

    /// Append failed items in order.
    ///
    /// When capped and full, the oldest queued items are dropped.
    pub fn append<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut inner = self.lock();
        for item in items {
            inner.total_received += 1;
            if let Some(cap) = self.max_capacity {
                if cap == 0 {
                    inner.total_dropped += 1;
                    continue;
                }
                while inner.items.len() >= cap {
                    inner.items.pop_front();
                    inner.total_dropped += 1;
                }
            }
            inner.items.push_back(item);
        }
    }

    /// Snapshot-and-clear: take every queued item for retry
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    /// Discard all queued items
    pub fn clear(&self) {
        self.lock().items.clear();
    }

    /// Number of items currently queued
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> FailureQueueStats {
        let inner = self.lock();
        FailureQueueStats {
            current_count: inner.items.len(),
            max_capacity: self.max_capacity,
            total_received: inner.total_received,
            total_dropped: inner.total_dropped,
        }
    }
}

impl<T> Default for FailureQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Statistics for the failure queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureQueueStats {
    /// Current number of queued items
    pub current_count: usize,
    /// Capacity bound, if any
    pub max_capacity: Option<usize>,
    /// Total items ever appended
    pub total_received: u64,
    /// Total items dropped due to capacity overflow
    pub total_dropped: u64,
}
