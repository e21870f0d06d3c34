//! Message hand-off between the frame decoder and the responder.
//!
//! One producer, one consumer. The lock is a plain `std::sync::Mutex` and is
//! never held across an `.await`; waking goes through a `Notify`, which keeps
//! a single permit when nobody is waiting so an enqueue cannot be missed.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Why a waiting consumer woke up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// At least one message is queued
    Ready,
    /// The producer is gone; nothing more will arrive
    Closed,
    /// Service-wide shutdown was requested
    Shutdown,
}

#[derive(Debug, Default)]
struct Inner {
    messages: VecDeque<String>,
    closed: bool,
}

/// FIFO message queue with atomic enqueue/dequeue.
#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<Inner>,
    available: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a message and signal availability.
    ///
    /// Messages pushed after `close` are dropped.
    pub fn enqueue(&self, message: String) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.messages.push_back(message);
        }
        self.available.notify_one();
    }

    /// Pop the oldest message.
    pub fn dequeue(&self) -> Option<String> {
        self.lock().messages.pop_front()
    }

    /// Remove and return everything currently queued, oldest first.
    pub fn dequeue_all(&self) -> Vec<String> {
        self.lock().messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard pending messages, mark the queue closed and wake the
    /// consumer so it can observe the closure.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.messages.clear();
            inner.closed = true;
        }
        self.available.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wait until messages are available, the queue is closed, or
    /// `shutdown` fires. Shutdown wins over everything else.
    pub async fn wait(&self, shutdown: &CancellationToken) -> Wake {
        loop {
            if shutdown.is_cancelled() {
                return Wake::Shutdown;
            }
            {
                let inner = self.lock();
                if inner.closed {
                    return Wake::Closed;
                }
                if !inner.messages.is_empty() {
                    return Wake::Ready;
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Wake::Shutdown,
                _ = self.available.notified() => {}
            }
        }
    }
}
