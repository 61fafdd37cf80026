//! Outbound message queue
//!
//! - `store`: durable table of undelivered messages
//! - `correlation`: in-memory map of requests awaiting a response
//! - `ordering`: FIFO + priority send order

pub mod correlation;
pub mod ordering;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ocpp::{Call, MessageType, OcppError};

pub use correlation::{CorrelationTable, PendingCorrelation};
pub use ordering::{PendingQueue, QueuedEntry};
pub use store::{shared, FileQueueStore, MemoryQueueStore, QueueStore, SharedStore, StorageConfig};

/// Send priority. `High` messages overtake queued `Normal` ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessagePriority {
    High,
    Normal,
}

/// A message the station must deliver to the CSMS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub unique_id: String,
    /// Enqueue order, assigned by the engine
    pub sequence: u64,
    pub message_type: MessageType,
    pub action: String,
    pub payload: Value,
    pub priority: MessagePriority,
    /// Transaction this message belongs to, if any
    pub transaction_id: Option<String>,
    /// Number of transmissions so far
    pub message_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn call(&self) -> Call {
        Call {
            message_id: self.unique_id.clone(),
            action: self.action.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Text frame as it goes on the wire
    pub fn to_frame(&self) -> Result<String, OcppError> {
        let bytes = self.call().to_bytes()?;
        String::from_utf8(bytes).map_err(|_| OcppError::InvalidFormat)
    }
}

/// Unique-id supplier owned by one engine instance.
///
/// Ids look like `3f2a9c1b-17`: a random per-instance prefix keeps ids from
/// different process lifetimes apart, the counter keeps them distinct within
/// one lifetime.
#[derive(Debug, Clone)]
pub struct MessageIdGenerator {
    prefix: String,
    next: u64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self::with_prefix(&uuid[..8])
    }

    /// Deterministic ids (`prefix-0`, `prefix-1`, ...)
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 0,
        }
    }

    pub fn next_id(&mut self) -> String {
        let id = format!("{}-{}", self.prefix, self.next);
        self.next += 1;
        id
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
