//! Per-source runtime state
//!
//! A [`SourceRuntime`] is everything one registered source owns while it
//! exists: its config, lifecycle status, statistics, queue, dedup set and
//! in-memory position. The monitor and processing loops share it through an
//! `Arc`; the manager drives its lifecycle.
//!
//! Lifecycle:
//!
//! ```text
//!  Stopped ──> Starting ──> Running <──> Paused
//!     ^           │  │         │           │
//!     │           │  └──> Error <┘         │
//!     │           v        │               │
//!     └──── Stopping <─────┴───────────────┘
//! ```
//!
//! `Error ──> Starting` is also allowed (restart after a failure).

use crate::config::SourceConfig;
use crate::dedup::DedupSet;
use crate::error::{CaptureError, Result};
use crate::metrics;
use crate::position::{Position, PositionStore};
use crate::queue::EventQueue;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle status of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    Error,
}

impl SourceStatus {
    /// Whether the state machine allows `self -> to`.
    pub fn can_transition_to(self, to: SourceStatus) -> bool {
        use SourceStatus::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Error, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Running, Paused)
                | (Running, Stopping)
                | (Running, Error)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }

    /// Numeric code for gauges.
    pub fn as_code(&self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Paused => 3,
            Self::Stopping => 4,
            Self::Error => 5,
        }
    }

    /// Whether capture tasks may be alive in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-source counters.
#[derive(Debug, Default)]
pub struct SourceStatistics {
    pub events_captured: AtomicU64,
    pub events_processed: AtomicU64,
    pub events_filtered: AtomicU64,
    pub events_duplicate: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_expired: AtomicU64,
    pub batches: AtomicU64,
    pub errors: AtomicU64,
    last_event_time: Mutex<Option<DateTime<Utc>>>,
    start_time: Mutex<Option<DateTime<Utc>>>,
}

impl SourceStatistics {
    pub(crate) fn touch_event(&self) {
        *self.last_event_time.lock() = Some(Utc::now());
    }

    pub(crate) fn set_start_time(&self, at: Option<DateTime<Utc>>) {
        *self.start_time.lock() = at;
    }

    pub(crate) fn set_last_event_time(&self, at: Option<DateTime<Utc>>) {
        *self.last_event_time.lock() = at;
    }

    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        *self.last_event_time.lock()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start_time.lock()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            events_captured: self.events_captured.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            duplicates: self.events_duplicate.load(Ordering::Relaxed),
            dropped: self.events_dropped.load(Ordering::Relaxed),
            expired: self.events_expired.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_event_time: self.last_event_time(),
            start_time: self.start_time(),
        }
    }
}

/// Point-in-time copy of [`SourceStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub events_captured: u64,
    pub events_processed: u64,
    pub events_filtered: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub expired: u64,
    pub batches: u64,
    pub errors: u64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
}

/// Status report of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatusSnapshot {
    pub source_id: String,
    pub name: String,
    pub source_type: String,
    pub status: SourceStatus,
    pub statistics: StatisticsSnapshot,
    pub position: String,
    pub queue_size: usize,
    pub queue_max_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct PositionState {
    /// Monitor's position: last handled marker
    current: Position,
    /// Last marker of a dispatched batch
    committed: Option<String>,
    /// Position this run started from, or the last one persisted
    base: Position,
    /// Bumped on manual reset
    epoch: u64,
}

/// Handles of the two loops of a started source.
pub(crate) struct SourceTasks {
    pub cancel: CancellationToken,
    pub monitor: JoinHandle<()>,
    pub processing: JoinHandle<()>,
}

impl SourceTasks {
    /// Cancel both loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in [("monitor", self.monitor), ("processing", self.processing)] {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Capture task ended abnormally");
            }
        }
    }
}

/// Shared state of one registered source.
pub struct SourceRuntime {
    id: String,
    config: RwLock<SourceConfig>,
    status: watch::Sender<SourceStatus>,
    pub(crate) stats: SourceStatistics,
    pub(crate) queue: EventQueue,
    pub(crate) dedup: Mutex<DedupSet>,
    position: Mutex<PositionState>,
    last_error: Mutex<Option<String>>,
    /// Serializes lifecycle operations; holds the loop handles while started.
    pub(crate) tasks: tokio::sync::Mutex<Option<SourceTasks>>,
}

impl SourceRuntime {
    pub fn new(config: SourceConfig) -> Self {
        let id = config.id.clone();
        let (status, _) = watch::channel(SourceStatus::Stopped);
        Self {
            queue: EventQueue::new(&id, config.max_queue_size),
            dedup: Mutex::new(DedupSet::new(config.dedup_capacity, config.dedup_eviction)),
            position: Mutex::new({
                let initial = Position::initial(&id, &config.initial_position);
                PositionState {
                    current: initial.clone(),
                    committed: None,
                    base: initial,
                    epoch: 0,
                }
            }),
            stats: SourceStatistics::default(),
            last_error: Mutex::new(None),
            tasks: tokio::sync::Mutex::new(None),
            config: RwLock::new(config),
            status,
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Copy of the current config.
    pub fn config(&self) -> SourceConfig {
        self.config.read().clone()
    }

    pub(crate) fn update_config(&self, f: impl FnOnce(&mut SourceConfig) -> Result<()>) -> Result<()> {
        let mut config = self.config.write();
        f(&mut config)?;
        self.queue.set_capacity(config.max_queue_size);
        Ok(())
    }

    pub fn status(&self) -> SourceStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SourceStatus> {
        self.status.subscribe()
    }

    /// Move to `to`, rejecting transitions the state machine forbids.
    pub fn transition(&self, to: SourceStatus) -> Result<SourceStatus> {
        let mut outcome = Err(CaptureError::invalid_state(String::new()));
        self.status.send_if_modified(|current| {
            if current.can_transition_to(to) {
                outcome = Ok(*current);
                *current = to;
                true
            } else {
                outcome = Err(CaptureError::invalid_state(format!(
                    "source '{}' cannot go from {} to {}",
                    self.id, current, to
                )));
                false
            }
        });

        let from = outcome?;
        metrics::source_status(&self.id, to);
        info!(source_id = %self.id, "Source {} -> {}", from, to);
        Ok(from)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub(crate) fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock() = error;
    }

    /// Record an unrecoverable failure: count it, remember it, go to Error.
    pub(crate) fn fail(&self, error: &CaptureError) {
        self.set_last_error(Some(error.to_string()));
        if let Err(e) = self.transition(SourceStatus::Error) {
            debug!(source_id = %self.id, error = %e, "Error transition skipped");
        }
    }

    /// Prepare for a (re)start: apply knobs that only take effect on start.
    pub(crate) fn prepare_start(&self, position: Position) {
        let config = self.config();
        self.queue.set_capacity(config.max_queue_size);
        {
            let mut dedup = self.dedup.lock();
            if dedup.capacity() != config.dedup_capacity
                || dedup.policy() != config.dedup_eviction
            {
                *dedup = DedupSet::new(config.dedup_capacity, config.dedup_eviction);
            }
        }
        {
            let mut state = self.position.lock();
            state.current = position.clone();
            state.base = position;
            state.committed = None;
        }
        self.set_last_error(None);
        self.stats.set_last_event_time(None);
        self.stats.set_start_time(Some(Utc::now()));
    }

    /// Current in-memory position.
    pub fn position(&self) -> Position {
        self.position.lock().current.clone()
    }

    /// Position plus the epoch it belongs to.
    pub(crate) fn position_with_epoch(&self) -> (Position, u64) {
        let state = self.position.lock();
        (state.current.clone(), state.epoch)
    }

    /// Advance to `marker` unless a reset happened since `epoch` was read.
    pub(crate) fn advance_position(&self, epoch: u64, marker: String) -> bool {
        let mut state = self.position.lock();
        if state.epoch != epoch {
            debug!(source_id = %self.id, "Discarding position advance after reset");
            return false;
        }
        state.current.advance(marker);
        true
    }

    /// Record the marker of the last dispatched event.
    pub(crate) fn commit(&self, marker: &str) {
        self.position.lock().committed = Some(marker.to_string());
    }

    /// Replace the position, forget dedup state and invalidate in-flight
    /// advances.
    pub(crate) fn reset_position(&self, position: Position) {
        {
            let mut state = self.position.lock();
            state.current = position.clone();
            state.base = position;
            state.committed = None;
            state.epoch += 1;
        }
        self.dedup.lock().clear();
    }

    /// Drop the queued events if any is older than `cutoff` and rewind so the
    /// monitor captures them again. The position moves back to the last
    /// dispatched marker, or to where this run started when nothing has
    /// been dispatched. Returns the number of events older than `cutoff`.
    pub(crate) fn expire_queued(&self, cutoff: DateTime<Utc>) -> usize {
        let drained = self.queue.drain_if_older_than(cutoff);
        if drained.is_empty() {
            return 0;
        }
        {
            let mut dedup = self.dedup.lock();
            for event in &drained {
                dedup.remove(&event.content_hash());
            }
        }
        let rewound = {
            let mut state = self.position.lock();
            let target = match &state.committed {
                Some(marker) => Position::new(&self.id, marker.clone()),
                None => state.base.clone(),
            };
            state.current = target;
            state.epoch += 1;
            state.current.payload.clone()
        };
        let expired = drained.iter().filter(|e| e.timestamp < cutoff).count();
        self.stats
            .events_expired
            .fetch_add(expired as u64, Ordering::Relaxed);
        info!(
            source_id = %self.id,
            expired,
            requeued = drained.len() - expired,
            "Rewound position to {} after expiring queued events",
            rewound
        );
        expired
    }

    /// Position that is safe to persist.
    ///
    /// The monitor position covers everything captured so far, but only once
    /// the queue has drained; otherwise fall back to the last dispatched
    /// marker.
    pub(crate) fn checkpoint_candidate(&self) -> Option<Position> {
        let (current, committed) = {
            let state = self.position.lock();
            (state.current.clone(), state.committed.clone())
        };
        if self.queue.is_empty() {
            return Some(current);
        }
        committed.map(|marker| Position::new(&self.id, marker))
    }

    /// Persist the checkpoint candidate. Failures are logged and counted.
    pub(crate) async fn persist_position(&self, store: &dyn PositionStore) {
        let Some(position) = self.checkpoint_candidate() else {
            return;
        };
        match store.save(&position).await {
            Ok(()) => {
                debug!(source_id = %self.id, "Checkpointed position {}", position.payload);
                self.position.lock().base = position;
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(source_id = %self.id, error = %e, "Failed to persist position");
            }
        }
    }

    pub fn snapshot(&self) -> SourceStatusSnapshot {
        let config = self.config.read();
        SourceStatusSnapshot {
            source_id: self.id.clone(),
            name: config.name.clone(),
            source_type: config.source_type.clone(),
            status: self.status(),
            statistics: self.stats.snapshot(),
            position: self.position().payload,
            queue_size: self.queue.len(),
            queue_max_size: self.queue.capacity(),
            last_error: self.last_error(),
        }
    }
}

impl fmt::Debug for SourceRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRuntime")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Wait until the source is Running.
///
/// Returns `false` when the loop should exit: cancelled, or the status left
/// the active states. Paused (and Starting) just wait for the next change.
pub(crate) async fn wait_until_running(
    status: &mut watch::Receiver<SourceStatus>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let current = *status.borrow_and_update();
        match current {
            SourceStatus::Running => return !cancel.is_cancelled(),
            SourceStatus::Paused | SourceStatus::Starting => {
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    changed = status.changed() => {
                        if changed.is_err() {
                            return false;
                        }
                    }
                }
            }
            SourceStatus::Stopping | SourceStatus::Stopped | SourceStatus::Error => return false,
        }
    }
}
