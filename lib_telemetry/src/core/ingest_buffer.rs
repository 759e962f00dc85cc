//! # Ingest Buffer
//!
//! A fixed-capacity, overwrite-oldest window over the most recent raw messages
//! received from the wire. Every message lands here before anything else looks
//! at it, so the window stays accurate even when the downstream stages are
//! saturated.
//!
//! ## Key Features:
//! - **O(1) record**: a full buffer evicts its oldest entry, counts the
//!   overflow and appends. Recording never fails and never allocates beyond the
//!   configured capacity.
//! - **Consistent statistics**: storage and counters live behind one lock, so a
//!   snapshot can never observe an eviction without its overflow increment.
//! - **Shared messages**: entries are `Arc<RawMessage>`, the same allocation the
//!   intake queue hands to the processing worker.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// # Raw Message
///
/// One (topic, payload) pair as delivered by the wire client, stamped with the
/// time it was received. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawMessage {
    /// Full topic string, e.g. `devices/helmet_01/sensors/gas`.
    pub topic: String,
    /// Payload decoded as UTF-8 text.
    pub payload: String,
    /// When the wire client handed the message over.
    pub receive_time: DateTime<Utc>,
    /// The payload parsed as JSON, when it is JSON.
    pub parsed_payload: Option<Value>,
}

impl RawMessage {
    /// Builds a message stamped with the current time, parsing the payload as
    /// JSON on a best-effort basis.
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::received_at(topic, payload, Utc::now())
    }

    /// Same as [`RawMessage::new`] with an explicit receive time.
    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<String>,
        receive_time: DateTime<Utc>,
    ) -> Self {
        let payload = payload.into();
        let parsed_payload = serde_json::from_str::<Value>(&payload).ok();
        Self {
            topic: topic.into(),
            payload,
            receive_time,
            parsed_payload,
        }
    }

    /// Builds a message from raw wire bytes. Invalid UTF-8 is replaced rather
    /// than rejected.
    pub fn from_bytes(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::new(topic, String::from_utf8_lossy(payload).into_owned())
    }
}

/// Point-in-time copy of the buffer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferSnapshot {
    /// Maximum number of messages held.
    pub capacity: usize,
    /// Messages currently held.
    pub current_size: usize,
    /// Every message ever recorded.
    pub messages_received: u64,
    /// Messages evicted to make room for newer ones.
    pub overflow_count: u64,
    /// Receive time of the most recent message.
    pub last_message_time: Option<DateTime<Utc>>,
}

struct BufferState {
    messages: VecDeque<Arc<RawMessage>>,
    messages_received: u64,
    overflow_count: u64,
    last_message_time: Option<DateTime<Utc>>,
}

/// Bounded ring of recent raw messages.
pub struct IngestBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
}

impl IngestBuffer {
    /// Creates a buffer holding at most `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BufferState {
                messages: VecDeque::with_capacity(capacity),
                messages_received: 0,
                overflow_count: 0,
                last_message_time: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a message, evicting the oldest one first when full.
    pub fn record(&self, message: Arc<RawMessage>) {
        let mut state = self.lock();
        if state.messages.len() >= self.capacity {
            state.messages.pop_front();
            state.overflow_count += 1;
        }
        state.last_message_time = Some(message.receive_time);
        state.messages.push_back(message);
        state.messages_received += 1;
    }

    /// Consistent copy of size and counters.
    pub fn snapshot(&self) -> BufferSnapshot {
        let state = self.lock();
        BufferSnapshot {
            capacity: self.capacity,
            current_size: state.messages.len(),
            messages_received: state.messages_received,
            overflow_count: state.overflow_count,
            last_message_time: state.last_message_time,
        }
    }

    /// Up to `n` most recent messages, newest first.
    ///
    /// The returned iterator owns its references, so the lock is released
    /// before the caller sees the first item.
    pub fn recent(&self, n: usize) -> std::vec::IntoIter<Arc<RawMessage>> {
        let state = self.lock();
        state
            .messages
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Drops every held message. Counters are kept.
    pub fn clear(&self) {
        self.lock().messages.clear();
    }

    /// Maximum number of messages held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(i: usize) -> Arc<RawMessage> {
        Arc::new(RawMessage::new(
            format!("devices/d{i}/sensors/gas"),
            format!("{{\"value\": {i}}}"),
        ))
    }

    #[test]
    fn test_overflow_keeps_last_capacity_messages() {
        let buffer = IngestBuffer::new(5);
        for i in 0..12 {
            buffer.record(msg(i));
            assert!(buffer.snapshot().current_size <= 5);
        }

        let snap = buffer.snapshot();
        assert_eq!(snap.current_size, 5);
        assert_eq!(snap.messages_received, 12);
        assert_eq!(snap.overflow_count, 7);

        let topics: Vec<String> = buffer.recent(10).map(|m| m.topic.clone()).collect();
        assert_eq!(
            topics,
            vec![
                "devices/d11/sensors/gas",
                "devices/d10/sensors/gas",
                "devices/d9/sensors/gas",
                "devices/d8/sensors/gas",
                "devices/d7/sensors/gas",
            ]
        );
    }

    #[test]
    fn test_no_overflow_below_capacity() {
        let buffer = IngestBuffer::new(3);
        buffer.record(msg(0));
        buffer.record(msg(1));

        let snap = buffer.snapshot();
        assert_eq!(snap.current_size, 2);
        assert_eq!(snap.overflow_count, 0);
        assert!(snap.last_message_time.is_some());
        assert_eq!(buffer.recent(1).next().unwrap().topic, "devices/d1/sensors/gas");
    }

    #[test]
    fn test_clear_keeps_counters() {
        let buffer = IngestBuffer::new(2);
        for i in 0..3 {
            buffer.record(msg(i));
        }
        buffer.clear();

        let snap = buffer.snapshot();
        assert_eq!(snap.current_size, 0);
        assert_eq!(snap.messages_received, 3);
        assert_eq!(snap.overflow_count, 1);
        assert_eq!(buffer.recent(5).count(), 0);
    }

    #[test]
    fn test_non_json_payload_is_kept_raw() {
        let raw = RawMessage::from_bytes("devices/d1/status/heartbeat", b"alive\xff");
        assert!(raw.parsed_payload.is_none());
        assert!(raw.payload.starts_with("alive"));
    }

    #[test]
    fn test_concurrent_record_respects_capacity() {
        let buffer = Arc::new(IngestBuffer::new(16));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        buffer.record(msg(t * 1000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = buffer.snapshot();
        assert_eq!(snap.messages_received, 1000);
        assert_eq!(snap.current_size, 16);
        assert_eq!(snap.overflow_count, 1000 - 16);
    }
}
