//! Bounded per-source event queue
//!
//! Hand-off point between the monitor (producer) and the processing loop
//! (consumer). Two `Notify` handles signal "item available" and "space
//! available" so neither side polls.

use crate::error::{CaptureError, Result};
use crate::event::ChangeEvent;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// FIFO queue with a fixed (but adjustable) capacity.
#[derive(Debug)]
pub struct EventQueue {
    source_id: String,
    inner: Mutex<VecDeque<ChangeEvent>>,
    capacity: AtomicUsize,
    items: Notify,
    space: Notify,
}

impl EventQueue {
    pub fn new(source_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            source_id: source_id.into(),
            inner: Mutex::new(VecDeque::new()),
            capacity: AtomicUsize::new(capacity.max(1)),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Change the capacity. A shrink below the current length keeps queued
    /// events; new pushes are refused until the queue drains below it.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Release);
        self.space.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Occupancy ratio (0.0 - 1.0+).
    pub fn fill_ratio(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }

    /// Enqueue without waiting.
    pub fn try_push(&self, event: ChangeEvent) -> Result<()> {
        let capacity = self.capacity();
        {
            let mut queue = self.inner.lock();
            if queue.len() >= capacity {
                return Err(CaptureError::QueueFull {
                    source_id: self.source_id.clone(),
                    capacity,
                });
            }
            queue.push_back(event);
        }
        self.items.notify_one();
        Ok(())
    }

    /// Enqueue, waiting for space. Returns `false` if cancelled first.
    pub async fn push_wait(&self, event: ChangeEvent, cancel: &CancellationToken) -> bool {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.inner.lock();
                if queue.len() < self.capacity() {
                    queue.push_back(event);
                    drop(queue);
                    self.items.notify_one();
                    return true;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<ChangeEvent> {
        let event = self.inner.lock().pop_front();
        if event.is_some() {
            self.space.notify_one();
        }
        event
    }

    /// Dequeue, waiting at most `timeout` for an item.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<ChangeEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Take every queued event if any of them is older than `cutoff`.
    /// Leaves the queue untouched and returns nothing otherwise.
    pub fn drain_if_older_than(&self, cutoff: DateTime<Utc>) -> Vec<ChangeEvent> {
        let drained: Vec<ChangeEvent> = {
            let mut queue = self.inner.lock();
            if !queue.iter().any(|e| e.timestamp < cutoff) {
                return Vec::new();
            }
            queue.drain(..).collect()
        };
        self.space.notify_one();
        drained
    }

    /// Remove everything, returning the number of dropped events.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut queue = self.inner.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if removed > 0 {
            self.space.notify_one();
        }
        removed
    }
}
