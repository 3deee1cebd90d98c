//! Pending action queue
//!
//! An [`ActionQueue`] decouples the producers of file events (watcher
//! callbacks, the startup walker) from the single dispatch loop of a
//! backend. It is an unbounded FIFO: `add` never blocks, and `get` waits
//! until a message is available.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use backupd_core::domain::Message;

/// Unbounded FIFO of [`Message`]s with a blocking `get`
#[derive(Debug, Default)]
pub struct ActionQueue {
    messages: Mutex<VecDeque<Message>>,
    available: Notify,
}

impl ActionQueue {
    /// Creates an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and wakes one waiting consumer
    ///
    /// Synchronous so it can be called from non-async contexts such as the
    /// notify callback thread.
    pub fn add(&self, message: Message) {
        self.lock().push_back(message);
        self.available.notify_one();
    }

    /// Removes and returns the oldest message, waiting for one if necessary
    ///
    /// Cancel safe: a message is only removed in the poll that returns it.
    pub async fn get(&self) -> Message {
        loop {
            if let Some(message) = self.try_get() {
                return message;
            }
            // A notify_one without a waiter stores a permit, so an add
            // between try_get and here is not missed.
            self.available.notified().await;
        }
    }

    /// Removes and returns the oldest message if there is one
    pub fn try_get(&self) -> Option<Message> {
        self.lock().pop_front()
    }

    /// Number of pending messages
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no message is pending
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
