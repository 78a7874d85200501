//! Bounded queue for publishes issued while a connection is being (re)established

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::{ClientError, Result};
use crate::message::Message;
use crate::token::CompletionToken;

/// FIFO of publishes awaiting a live connection.
///
/// Each entry keeps the caller's token, so the caller learns the outcome when
/// the entry is finally sent or failed.
#[derive(Debug)]
pub struct OfflineQueue {
    entries: Mutex<VecDeque<(Message, CompletionToken)>>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Queue a publish. Fails without queueing when the queue is full.
    pub fn push(&self, message: Message, token: CompletionToken) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return Err(ClientError::Connection(
                "offline publish queue is full".to_string(),
            ));
        }
        entries.push_back((message, token));
        Ok(())
    }

    /// Take every queued entry in submission order
    pub fn drain(&self) -> Vec<(Message, CompletionToken)> {
        self.entries.lock().drain(..).collect()
    }

    /// Fail and discard every queued entry
    pub fn fail_all(&self, error: ClientError) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for (_, token) in drained {
            token.fail(error.clone());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
