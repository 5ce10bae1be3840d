//! # Batching
//!
//! Dual-trigger batching for the processing loop.
//!
//! ## Triggers
//!
//! - **Size**: flush once `batch_size` events are pending
//! - **Time**: flush once the oldest pending event has waited `max_delay`
//!
//! A batch opens when its first event arrives; empty batches are never
//! produced.

use crate::event::{ChangeEvent, EventKind};
use std::time::Duration;
use tokio::time::Instant;

/// A batch of change events ready for dispatch.
#[derive(Debug, Clone)]
pub struct EventBatch {
    /// Source the events came from
    pub source_id: String,
    /// Events in capture order
    pub events: Vec<ChangeEvent>,
    /// Per-source sequence number, starting at 1
    pub sequence: u64,
    /// When the first event entered the batch
    pub created_at: Instant,
    /// When the batch was flushed
    pub flushed_at: Instant,
}

impl EventBatch {
    /// Number of events in batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if batch is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Time spent waiting before flush.
    pub fn wait_time(&self) -> Duration {
        self.flushed_at.duration_since(self.created_at)
    }

    /// Position marker of the last event that carries one.
    pub fn last_position(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|e| e.position.as_deref())
    }

    /// Count events by kind.
    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for event in &self.events {
            match event.kind {
                EventKind::Insert => counts.inserts += 1,
                EventKind::Update => counts.updates += 1,
                EventKind::Delete => counts.deletes += 1,
                EventKind::Truncate => counts.truncates += 1,
                EventKind::SchemaChange => counts.schema_changes += 1,
                EventKind::Heartbeat => counts.heartbeats += 1,
            }
        }
        counts
    }
}

/// Counts of events by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub truncates: usize,
    pub schema_changes: usize,
    pub heartbeats: usize,
}

impl BatchCounts {
    pub fn total(&self) -> usize {
        self.inserts
            + self.updates
            + self.deletes
            + self.truncates
            + self.schema_changes
            + self.heartbeats
    }
}

/// Accumulates events and decides when to flush.
#[derive(Debug)]
pub struct Batcher {
    source_id: String,
    batch_size: usize,
    max_delay: Duration,
    events: Vec<ChangeEvent>,
    opened_at: Option<Instant>,
    sequence: u64,
}

impl Batcher {
    pub fn new(source_id: impl Into<String>, batch_size: usize, max_delay: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            source_id: source_id.into(),
            batch_size,
            max_delay,
            events: Vec::with_capacity(batch_size.min(4096)),
            opened_at: None,
            sequence: 0,
        }
    }

    /// Add an event; returns a batch if the size trigger fired.
    pub fn add(&mut self, event: ChangeEvent) -> Option<EventBatch> {
        if self.events.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.events.push(event);

        if self.events.len() >= self.batch_size {
            self.flush()
        } else {
            None
        }
    }

    /// Returns a batch if the time trigger fired.
    pub fn check_timeout(&mut self) -> Option<EventBatch> {
        match self.opened_at {
            Some(opened) if !self.events.is_empty() && opened.elapsed() >= self.max_delay => {
                self.flush()
            }
            _ => None,
        }
    }

    /// Force flush the pending events.
    pub fn flush(&mut self) -> Option<EventBatch> {
        if self.events.is_empty() {
            return None;
        }
        self.sequence += 1;
        let created_at = self.opened_at.take().unwrap_or_else(Instant::now);
        let events = std::mem::replace(
            &mut self.events,
            Vec::with_capacity(self.batch_size.min(4096)),
        );
        Some(EventBatch {
            source_id: self.source_id.clone(),
            events,
            sequence: self.sequence,
            created_at,
            flushed_at: Instant::now(),
        })
    }

    /// Time left before the open batch must flush; `None` when empty.
    pub fn time_until_deadline(&self) -> Option<Duration> {
        let opened = self.opened_at?;
        if self.events.is_empty() {
            return None;
        }
        Some(self.max_delay.saturating_sub(opened.elapsed()))
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Sequence number of the last flushed batch.
    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_event(kind: EventKind) -> ChangeEvent {
        let mut event = ChangeEvent::new("s1", kind).with_table("users");
        event.after = Some(json!({"id": 1}));
        event
    }

    #[test]
    fn test_batcher_size_limit() {
        let mut batcher = Batcher::new("s1", 3, Duration::from_secs(1));

        assert!(batcher.add(make_event(EventKind::Insert)).is_none());
        assert!(batcher.add(make_event(EventKind::Update)).is_none());

        let batch = batcher.add(make_event(EventKind::Delete)).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.source_id, "s1");
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_batcher_force_flush() {
        let mut batcher = Batcher::new("s1", 100, Duration::from_secs(1));
        batcher.add(make_event(EventKind::Insert));
        batcher.add(make_event(EventKind::Insert));

        assert_eq!(batcher.flush().unwrap().len(), 2);
        assert!(batcher.flush().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batcher_time_trigger() {
        let mut batcher = Batcher::new("s1", 3, Duration::from_secs(1));
        assert!(batcher.check_timeout().is_none());
        assert!(batcher.time_until_deadline().is_none());

        batcher.add(make_event(EventKind::Insert));
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(batcher.check_timeout().is_none());
        assert_eq!(
            batcher.time_until_deadline(),
            Some(Duration::from_millis(600))
        );

        batcher.add(make_event(EventKind::Insert));
        tokio::time::advance(Duration::from_millis(600)).await;

        let batch = batcher.check_timeout().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.wait_time(), Duration::from_secs(1));
        assert!(batcher.check_timeout().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_opens_on_first_event() {
        let mut batcher = Batcher::new("s1", 3, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(5)).await;
        batcher.add(make_event(EventKind::Insert));
        assert!(batcher.check_timeout().is_none());
    }

    #[test]
    fn test_batch_counts_and_last_position() {
        let mut batcher = Batcher::new("s1", 10, Duration::from_secs(1));
        batcher.add(make_event(EventKind::Insert).with_position("1"));
        batcher.add(make_event(EventKind::Insert).with_position("2"));
        batcher.add(make_event(EventKind::Update));
        batcher.add(make_event(EventKind::Heartbeat));

        let batch = batcher.flush().unwrap();
        let counts = batch.counts();
        assert_eq!(counts.inserts, 2);
        assert_eq!(counts.updates, 1);
        assert_eq!(counts.heartbeats, 1);
        assert_eq!(counts.total(), 4);
        assert_eq!(batch.last_position(), Some("2"));
    }

    #[test]
    fn test_batch_sequence_numbers() {
        let mut batcher = Batcher::new("s1", 1, Duration::from_secs(1));

        let b1 = batcher.add(make_event(EventKind::Insert)).unwrap();
        let b2 = batcher.add(make_event(EventKind::Insert)).unwrap();
        let b3 = batcher.add(make_event(EventKind::Insert)).unwrap();

        assert_eq!(b1.sequence, 1);
        assert_eq!(b2.sequence, 2);
        assert_eq!(b3.sequence, 3);
        assert_eq!(batcher.last_sequence(), 3);
    }
}
