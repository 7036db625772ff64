//! Pending start-acknowledgement table
//!
//! Entries are kept in the order streams were started. The remote side
//! answers start requests in the order it received them, so when an ack
//! does not name its message the oldest entry is the right one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use sg_core::Clock;
use sg_protocol::MessageId;

#[derive(Debug, Clone)]
struct PendingAck {
    message_id: MessageId,
    deadline: Instant,
}

/// Ordered table of streams awaiting a start acknowledgement
pub struct AckTable {
    clock: Arc<dyn Clock>,
    timeout: Duration,
    pending: Mutex<VecDeque<PendingAck>>,
}

impl AckTable {
    /// Create a table whose entries expire `timeout` after they are added
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            clock,
            timeout,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<PendingAck>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start waiting for `message_id`. Returns false if it is already waiting.
    pub fn begin_wait(&self, message_id: &MessageId) -> bool {
        let deadline = self.clock.now() + self.timeout;
        let mut pending = self.pending();
        if pending.iter().any(|p| &p.message_id == message_id) {
            return false;
        }
        pending.push_back(PendingAck {
            message_id: message_id.clone(),
            deadline,
        });
        true
    }

    /// Stop waiting for `message_id`. Returns false if it was not waiting.
    pub fn remove(&self, message_id: &MessageId) -> bool {
        let mut pending = self.pending();
        match pending.iter().position(|p| &p.message_id == message_id) {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Take the oldest waiting entry
    pub fn pop_oldest(&self) -> Option<MessageId> {
        self.pending().pop_front().map(|p| p.message_id)
    }

    /// Take every entry whose deadline is at or before `now`
    pub fn take_expired(&self, now: Instant) -> Vec<MessageId> {
        let mut pending = self.pending();
        let mut expired = Vec::new();
        pending.retain(|p| {
            if p.deadline <= now {
                expired.push(p.message_id.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Drop every entry, returning how many there were
    pub fn clear(&self) -> usize {
        let mut pending = self.pending();
        let count = pending.len();
        pending.clear();
        count
    }

    /// Whether `message_id` is waiting
    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.pending().iter().any(|p| &p.message_id == message_id)
    }

    /// Number of waiting entries
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}
