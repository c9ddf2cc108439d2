//! Double-buffered single-item frame slot

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

/// Two storage cells and an atomic front index.
///
/// The writer stores into the back cell and then publishes it by swapping the
/// front index. Each cell has its own lock, so a reader only contends with a
/// write to the same cell and always sees either the previous or the new
/// complete value.
pub struct DoubleBuffer<T> {
    cells: [Mutex<Option<T>>; 2],
    front: AtomicUsize,
    /// Serializes writers so back-cell selection and publish are one step
    writer: Mutex<()>,
    version: AtomicU64,
}

impl<T> DoubleBuffer<T> {
    pub fn new() -> Self {
        Self {
            cells: [Mutex::new(None), Mutex::new(None)],
            front: AtomicUsize::new(0),
            writer: Mutex::new(()),
            version: AtomicU64::new(0),
        }
    }

    /// Write into the back cell, then make it the front
    pub fn write(&self, value: T) {
        let _writer = self.writer.lock();
        let back = 1 - self.front.load(Ordering::Acquire);
        *self.cells[back].lock() = Some(value);
        self.front.store(back, Ordering::Release);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Lock the current front cell. Holding the guard blocks the producer's
    /// write into this cell only, never the next publish.
    pub fn lock_front(&self) -> MutexGuard<'_, Option<T>> {
        let front = self.front.load(Ordering::Acquire);
        self.cells[front].lock()
    }

    /// Number of values published so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.version() == 0
    }

    pub fn clear(&self) {
        let _writer = self.writer.lock();
        for cell in &self.cells {
            *cell.lock() = None;
        }
    }
}

impl<T: Clone> DoubleBuffer<T> {
    /// Non-blocking snapshot of the front value
    pub fn read(&self) -> Option<T> {
        self.lock_front().clone()
    }
}

impl<T> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
