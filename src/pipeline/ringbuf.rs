//! Bounded frame queue with oldest-drop overflow

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use ::ringbuf::traits::{Consumer, Observer, RingBuffer};
use ::ringbuf::HeapRb;

/// Bounded FIFO for consumers that must not skip every frame but tolerate
/// bounded loss. A push into a full queue evicts the oldest entry instead of
/// blocking the producer.
pub struct BoundedQueue<T> {
    ring: Mutex<HeapRb<T>>,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: enqueue, returning the evicted oldest entry if the queue was full
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = self.ring.lock().push_overwrite(item);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Consumer: non-blocking dequeue of the oldest entry
    pub fn pop(&self) -> Option<T> {
        let item = self.ring.lock().try_pop();
        if item.is_some() {
            self.stats.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    pub fn len(&self) -> usize {
        self.ring.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every pending entry
    pub fn clear(&self) -> usize {
        let mut ring = self.ring.lock();
        let mut cleared = 0;
        while ring.try_pop().is_some() {
            cleared += 1;
        }
        cleared
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
