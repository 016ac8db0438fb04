//! Drop-oldest bounded queue
//!
//! Fixed-capacity FIFO shared between any number of producers and a single consumer.
//! Producers never wait: when the buffer is full the oldest entry is evicted to make room,
//! so the consumer always sees the freshest data. The consumer suspends on an empty queue
//! until the next `enqueue`.
//!
//! ```text
//! producers ──enqueue──► [ head … tail ] ──dequeue──► single consumer
//!                          ▲ evicted when full
//! ```

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Fixed-capacity FIFO with drop-oldest overflow.
///
/// The internal lock is only held for the push/pop itself, never across an await point.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    capacity: NonZeroUsize,
    items: Mutex<VecDeque<T>>,
    // signalled on every enqueue
    available: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.get())),
            available: Notify::new(),
        }
    }

    /// Appends `item` at the tail without blocking.
    ///
    /// Returns the evicted head item when the queue was already full.
    pub fn enqueue(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity.get() {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        // notify_one keeps a permit when the consumer is not parked yet
        self.available.notify_one();
        evicted
    }

    /// Removes and returns the head item, suspending while the queue is empty.
    pub async fn dequeue(&self) -> T {
        loop {
            if let Some(item) = self.try_dequeue() {
                return item;
            }
            self.available.notified().await;
        }
    }

    /// Removes the head item if one is present.
    pub fn try_dequeue(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Current occupancy. Advisory only; may be stale as soon as it is returned.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    // A panic while holding the lock cannot leave the deque half-updated.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
