//! Send order of undelivered messages
//!
//! Entries are ranked by:
//! 1. Retransmissions of a message already put on the wire
//! 2. Messages pending when the connection came up (replay)
//! 3. New traffic
//!
//! and within a rank by priority, then enqueue sequence.

use tokio::time::Instant;

use super::{MessagePriority, OutboundMessage};
use crate::ocpp::Action;

#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub message: OutboundMessage,
    /// Was pending when the current connection was established
    pub replay: bool,
    /// Backoff: do not transmit before this instant
    pub not_before: Option<Instant>,
}

impl QueuedEntry {
    pub fn new(message: OutboundMessage) -> Self {
        Self {
            message,
            replay: false,
            not_before: None,
        }
    }

    fn rank(&self) -> u8 {
        if self.message.message_attempts > 0 {
            0
        } else if self.replay {
            1
        } else {
            2
        }
    }

    fn sort_key(&self) -> (u8, MessagePriority, u64) {
        (self.rank(), self.message.priority, self.message.sequence)
    }

    pub fn unique_id(&self) -> &str {
        &self.message.unique_id
    }
}

/// Undelivered messages in send order. Mirrors the durable store.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Vec<QueuedEntry>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueuedEntry) {
        let key = entry.sort_key();
        let pos = self.entries.partition_point(|e| e.sort_key() <= key);
        self.entries.insert(pos, entry);
    }

    pub fn remove(&mut self, unique_id: &str) -> Option<QueuedEntry> {
        let pos = self.entries.iter().position(|e| e.unique_id() == unique_id)?;
        Some(self.entries.remove(pos))
    }

    pub fn get(&self, unique_id: &str) -> Option<&QueuedEntry> {
        self.entries.iter().find(|e| e.unique_id() == unique_id)
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.get(unique_id).is_some()
    }

    /// Record a transmission; the entry moves to the retransmission rank.
    pub fn record_attempt(&mut self, unique_id: &str) -> Option<u32> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.message.unique_id == unique_id)?;
        entry.message.message_attempts += 1;
        entry.not_before = None;
        let attempts = entry.message.message_attempts;
        self.entries.sort_by_key(QueuedEntry::sort_key);
        Some(attempts)
    }

    /// Hold a message back until `until`
    pub fn defer(&mut self, unique_id: &str, until: Instant) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.message.unique_id == unique_id)
        {
            entry.not_before = Some(until);
        }
    }

    /// New connection: everything pending is replayed ahead of new traffic
    /// and backoff waits are dropped.
    pub fn mark_all_replay(&mut self) {
        for entry in &mut self.entries {
            entry.replay = true;
            entry.not_before = None;
        }
        self.entries.sort_by_key(QueuedEntry::sort_key);
    }

    /// Next message to transmit, if any may go now.
    ///
    /// Until registration is accepted only BootNotification may pass the
    /// gate. Otherwise the head of the queue blocks everything behind it,
    /// including while it waits out a backoff.
    pub fn next_sendable(&self, gate_closed: bool, now: Instant) -> Option<&QueuedEntry> {
        let candidate = if gate_closed {
            self.entries
                .iter()
                .find(|e| e.message.action == Action::BootNotification.as_str())?
        } else {
            self.entries.first()?
        };

        match candidate.not_before {
            Some(at) if at > now => None,
            _ => Some(candidate),
        }
    }

    /// Earliest backoff that has not yet elapsed
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|e| e.not_before)
            .filter(|at| *at > now)
            .min()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
