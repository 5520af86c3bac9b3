//! Thread-safe condition queue.
//!
//! A FIFO shared between producer and consumer threads: `push` never blocks,
//! `pop` blocks until an element arrives or the queue is reset. Reset drops
//! everything queued and wakes every blocked consumer with `None`, which is
//! how teardown interrupts application threads parked on delivery.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Unbounded FIFO with blocking pop and a teardown-friendly reset.
pub struct CondQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    resets: u64,
}

impl<T> CondQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                resets: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append an element and wake one waiter.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.items.push_back(item);
        self.cond.notify_one();
    }

    /// Block until an element is available, then remove and return it.
    ///
    /// Returns `None` if the queue is reset while waiting.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let entered_at = inner.resets;
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.resets != entered_at {
                return None;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Remove and return the front element without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Drop all queued elements and unblock every waiting `pop`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.resets += 1;
        self.cond.notify_all();
    }
}

impl<T> Default for CondQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
