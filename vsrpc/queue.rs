//! Bounded, closable FIFO queue of inbound payloads.
//!
//! Each [`crate::call::Call`] owns one `Queue<Bytes>` of decoded REQUEST or
//! RESPONSE payloads. It is a condition-variable-style structure: pushers
//! never block (the bound is cooperative, enforced by the caller checking
//! `len()`), and `recv`/`wait_recv` block until data or closure.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

struct State<T> {
    items: VecDeque<T>,
    done: bool,
}

/// A FIFO of items with two end-conditions (open, closed).
pub struct Queue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: Clone + Send> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> Queue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                done: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Appends `item` iff the queue is still open. Returns whether it was
    /// accepted.
    pub async fn push(&self, item: T) -> bool {
        let mut state = self.state.lock().await;
        if state.done {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Marks the queue closed. Idempotent; wakes every waiter.
    pub async fn done(&self) {
        let mut state = self.state.lock().await;
        if state.done {
            return;
        }
        state.done = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Returns `(item, ok, done)`.
    ///
    /// `ok` is true iff an item was returned. `done` reports whether the
    /// queue is closed at the time of return. If `blocking` and the queue is
    /// empty and not yet closed, waits for a push or a close; once closed,
    /// never blocks again even if items remain unread is false — draining
    /// continues to return queued items before reporting `done` with no item.
    pub async fn recv(&self, blocking: bool) -> (Option<T>, bool, bool) {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(item) = state.items.pop_front() {
                    let done = state.done && state.items.is_empty();
                    return (Some(item), true, done);
                }
                if state.done {
                    return (None, false, true);
                }
                if !blocking {
                    return (None, false, false);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Blocks until at least `min` items are queued or the queue is closed.
    pub async fn wait_recv(&self, min: usize) {
        loop {
            {
                let state = self.state.lock().await;
                if state.items.len() >= min || state.done {
                    return;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Current queued item count (does not reflect closed state).
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_done(&self) -> bool {
        self.state.lock().await.done
    }
}
