//! Property tests for send order
//!
//! - High priority overtakes Normal, FIFO within a priority
//! - A transmitted message keeps the head
//! - Messages pending at connection time go before anything enqueued later

use chrono::Utc;
use ocpp_engine::ocpp::MessageType;
use ocpp_engine::queue::{MessagePriority, OutboundMessage, PendingQueue, QueuedEntry};
use proptest::prelude::*;
use tokio::time::Instant;

// ============================================================================
// Strategies
// ============================================================================

fn priority() -> impl Strategy<Value = MessagePriority> {
    prop_oneof![Just(MessagePriority::High), Just(MessagePriority::Normal)]
}

fn priorities() -> impl Strategy<Value = Vec<MessagePriority>> {
    prop::collection::vec(priority(), 1..40)
}

fn entry(sequence: u64, priority: MessagePriority) -> QueuedEntry {
    QueuedEntry::new(OutboundMessage {
        unique_id: format!("m{}", sequence),
        sequence,
        message_type: MessageType::Call,
        action: "DataTransfer".to_string(),
        payload: serde_json::json!({}),
        priority,
        transaction_id: None,
        message_attempts: 0,
        enqueued_at: Utc::now(),
    })
}

fn fill(queue: &mut PendingQueue, first: u64, priorities: &[MessagePriority]) {
    for (i, p) in priorities.iter().enumerate() {
        queue.push(entry(first + i as u64, *p));
    }
}

fn order(queue: &PendingQueue) -> Vec<u64> {
    queue.iter().map(|e| e.message.sequence).collect()
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn priority_then_fifo(priorities in priorities()) {
        let mut queue = PendingQueue::new();
        fill(&mut queue, 0, &priorities);

        let mut expected: Vec<(MessagePriority, u64)> = priorities
            .iter()
            .enumerate()
            .map(|(i, p)| (*p, i as u64))
            .collect();
        expected.sort();
        let expected: Vec<u64> = expected.into_iter().map(|(_, s)| s).collect();

        prop_assert_eq!(order(&queue), expected);
    }

    #[test]
    fn transmitted_message_keeps_head(
        priorities in priorities(),
        later in priorities(),
        pick in any::<prop::sample::Index>()
    ) {
        let mut queue = PendingQueue::new();
        fill(&mut queue, 0, &priorities);
        let sent = pick.index(priorities.len()) as u64;
        queue.record_attempt(&format!("m{}", sent));
        fill(&mut queue, priorities.len() as u64, &later);

        prop_assert_eq!(order(&queue)[0], sent);
        let head = queue.next_sendable(false, Instant::now()).unwrap();
        prop_assert_eq!(head.message.sequence, sent);
    }

    #[test]
    fn replay_before_new_traffic(pending in priorities(), fresh in priorities()) {
        let mut queue = PendingQueue::new();
        fill(&mut queue, 0, &pending);
        queue.mark_all_replay();
        fill(&mut queue, pending.len() as u64, &fresh);

        let order = order(&queue);
        let (replayed, new) = order.split_at(pending.len());
        prop_assert!(replayed.iter().all(|s| *s < pending.len() as u64));
        prop_assert!(new.iter().all(|s| *s >= pending.len() as u64));
    }
}
