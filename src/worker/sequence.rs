//! Per-sender ordering check on the read path.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::core::errors::{Result, SmokeError};

/// Identity of one producer of one routing key.
#[must_use]
pub fn sender_id(routing_key: &str, task_id: &str) -> String {
    format!("{routing_key}-{task_id}")
}

/// Remembers the last sequence number seen per sender and rejects any event
/// that does not advance it.
#[derive(Debug, Default)]
pub struct SequenceValidator {
    last_seen: Mutex<HashMap<String, u64>>,
}

impl SequenceValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `sequence` for `sender_id` if it is strictly greater than the
    /// last accepted one (an unseen sender starts at 0).
    pub fn validate(&self, sender_id: &str, sequence: u64) -> Result<()> {
        let mut last_seen = self.last_seen.lock();
        let last = last_seen.get(sender_id).copied().unwrap_or(0);
        if sequence <= last {
            return Err(SmokeError::OutOfSequence {
                sender_id: sender_id.to_string(),
                last,
                current: sequence,
            });
        }
        last_seen.insert(sender_id.to_string(), sequence);
        Ok(())
    }

    /// Number of distinct senders seen.
    #[must_use]
    pub fn senders(&self) -> usize {
        self.last_seen.lock().len()
    }
}
