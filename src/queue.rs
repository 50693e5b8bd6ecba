//! Mutex/condvar-guarded FIFO shared by task queues and idle-worker pools.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded thread-safe FIFO.
///
/// `try_pop` is the non-blocking path used by idle-worker pools and pending
/// task queues; `pop` blocks until an item arrives or the queue is closed.
/// Items still queued when the queue closes are dropped, never handed out:
/// shutdown must not execute work that was queued but never dispatched.
pub struct ThreadSafeQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T> ThreadSafeQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { items: VecDeque::new(), closed: false }),
            available: Condvar::new(),
        }
    }

    /// Append an item and wake one waiter. Items pushed after `close` are
    /// accepted but will never be popped.
    pub fn push(&self, item: T) {
        let mut state = self.state.lock();
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
    }

    /// Pop the front item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.items.pop_front()
    }

    /// Block until an item is available or the queue is closed.
    /// Returns `None` once closed.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.available.wait(&mut state);
        }
    }

    /// Close the queue and wake all waiters.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
