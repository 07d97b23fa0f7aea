//! Unit tests for the bounded event buffer.

use agent_runner::protocol::{AlertSeverity, EventPayload, RunnerEvent};
use agent_runner::stream::buffer::EventBuffer;

fn event(seq: u64) -> RunnerEvent {
    RunnerEvent {
        session_id: "s1".into(),
        org_id: "org".into(),
        ts: 0,
        seq,
        payload: EventPayload::AlertRaised {
            severity: AlertSeverity::Info,
            message: format!("event {seq}"),
        },
    }
}

#[test]
fn holds_events_up_to_capacity_without_eviction() {
    let mut buffer = EventBuffer::new(3);
    assert!(buffer.push(event(1)).is_none());
    assert!(buffer.push(event(2)).is_none());
    assert!(buffer.push(event(3)).is_none());
    assert_eq!(buffer.len(), 3);
}

#[test]
fn overflow_evicts_exactly_one_oldest_entry() {
    let mut buffer = EventBuffer::new(3);
    for seq in 1..=3 {
        buffer.push(event(seq));
    }

    let evicted = buffer.push(event(4)).expect("oldest entry should be evicted");
    assert_eq!(evicted.seq, 1);
    assert_eq!(buffer.len(), 3);

    let evicted = buffer.push(event(5)).expect("oldest entry should be evicted");
    assert_eq!(evicted.seq, 2);
    assert_eq!(buffer.len(), 3);
}

#[test]
fn five_inserts_into_capacity_three_keeps_the_newest_three() {
    let mut buffer = EventBuffer::new(3);
    let mut evicted = Vec::new();
    for seq in 1..=5 {
        if let Some(old) = buffer.push(event(seq)) {
            evicted.push(old.seq);
        }
    }

    assert_eq!(evicted, vec![1, 2]);
    let remaining: Vec<u64> = buffer.iter().map(|e| e.seq).collect();
    assert_eq!(remaining, vec![3, 4, 5]);
}

#[test]
fn pop_front_returns_oldest_first() {
    let mut buffer = EventBuffer::new(4);
    for seq in 1..=3 {
        buffer.push(event(seq));
    }
    assert_eq!(buffer.pop_front().map(|e| e.seq), Some(1));
    assert_eq!(buffer.pop_front().map(|e| e.seq), Some(2));
    assert_eq!(buffer.pop_front().map(|e| e.seq), Some(3));
    assert!(buffer.pop_front().is_none());
}

#[test]
fn push_front_restores_flush_order() {
    let mut buffer = EventBuffer::new(4);
    for seq in 1..=3 {
        buffer.push(event(seq));
    }

    let head = buffer.pop_front().expect("non-empty");
    buffer.push_front(head);

    let order: Vec<u64> = buffer.iter().map(|e| e.seq).collect();
    assert_eq!(order, vec![1, 2, 3]);
}

#[test]
fn zero_capacity_is_clamped_to_one() {
    let mut buffer = EventBuffer::new(0);
    assert_eq!(buffer.capacity(), 1);
    assert!(buffer.push(event(1)).is_none());
    let evicted = buffer.push(event(2)).expect("one-slot buffer evicts");
    assert_eq!(evicted.seq, 1);
    assert!(!buffer.is_empty());
}
