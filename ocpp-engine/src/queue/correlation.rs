//! Correlation table
//!
//! Maps the unique id of every request on the wire to the state needed to
//! resolve it. With one logical channel per connection the table never holds
//! more than one entry, and "table is idle" is the in-flight flag the send path
//! checks.

use std::collections::HashMap;

use tokio::time::Instant;

/// A request awaiting its CALLRESULT/CALLERROR
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCorrelation {
    pub unique_id: String,
    /// Action of the request; shapes how the response is interpreted
    pub action: String,
    pub deadline: Instant,
    pub retries_remaining: u32,
}

#[derive(Debug)]
pub struct CorrelationTable {
    entries: HashMap<String, PendingCorrelation>,
    capacity: usize,
}

impl CorrelationTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// One outstanding request at a time
    pub fn single_channel() -> Self {
        Self::new(1)
    }

    /// Register an outstanding request. Hands the entry back when full.
    pub fn insert(&mut self, pending: PendingCorrelation) -> Result<(), PendingCorrelation> {
        if self.entries.len() >= self.capacity {
            return Err(pending);
        }
        self.entries.insert(pending.unique_id.clone(), pending);
        Ok(())
    }

    pub fn remove(&mut self, unique_id: &str) -> Option<PendingCorrelation> {
        self.entries.remove(unique_id)
    }

    pub fn get(&self, unique_id: &str) -> Option<&PendingCorrelation> {
        self.entries.get(unique_id)
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.entries.contains_key(unique_id)
    }

    /// True when another request may go on the wire
    pub fn is_idle(&self) -> bool {
        self.entries.len() < self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest response deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    /// Remove and return every entry whose deadline has passed
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingCorrelation> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.unique_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }

    /// Drop every entry (connection lost)
    pub fn clear(&mut self) -> Vec<PendingCorrelation> {
        self.entries.drain().map(|(_, p)| p).collect()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::single_channel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pending(id: &str, deadline: Instant) -> PendingCorrelation {
        PendingCorrelation {
            unique_id: id.to_string(),
            action: "Heartbeat".to_string(),
            deadline,
            retries_remaining: 2,
        }
    }

    #[test]
    fn test_single_channel_capacity() {
        let now = Instant::now();
        let mut table = CorrelationTable::single_channel();
        assert!(table.is_idle());

        table.insert(pending("a", now)).unwrap();
        assert!(!table.is_idle());
        assert!(table.insert(pending("b", now)).is_err());

        assert!(table.remove("a").is_some());
        assert!(table.remove("a").is_none());
        assert!(table.is_idle());
    }

    #[test]
    fn test_take_expired() {
        let now = Instant::now();
        let mut table = CorrelationTable::new(2);
        table.insert(pending("old", now)).unwrap();
        table
            .insert(pending("new", now + Duration::from_secs(10)))
            .unwrap();

        assert_eq!(table.next_deadline(), Some(now));
        let expired = table.take_expired(now + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].unique_id, "old");
        assert!(table.contains("new"));
    }
}
