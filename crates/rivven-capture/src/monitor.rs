//! Monitor loop
//!
//! One per started source. Each cycle:
//!
//! 1. capture from the connector at the current position (with retries)
//! 2. per event: stamp, count, dedup, filter, enqueue
//! 3. advance the in-memory position to the last handled marker
//! 4. sleep `poll_interval`
//!
//! The position never moves past an event that backpressure dropped, so a
//! replay from the stored position delivers it again.

use crate::config::{BackpressureStrategy, SourceConfig};
use crate::connector::CaptureConnector;
use crate::error::{CaptureError, Result};
use crate::event::ChangeEvent;
use crate::filter::{FilterChain, FilterDecision};
use crate::metrics;
use crate::position::Position;
use crate::source::{wait_until_running, SourceRuntime};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run the monitor loop until cancelled or failed.
pub(crate) async fn run(
    runtime: Arc<SourceRuntime>,
    connector: Arc<dyn CaptureConnector>,
    filters: Arc<FilterChain>,
    cancel: CancellationToken,
) {
    let source_id = runtime.id().to_string();
    let mut status = runtime.subscribe();
    info!(source_id = %source_id, "Monitor started");

    while wait_until_running(&mut status, &cancel).await {
        let config = runtime.config();
        let (position, epoch) = runtime.position_with_epoch();

        match capture_with_retry(&*connector, &config, &position, &cancel).await {
            Ok(Some(events)) => {
                let advance = handle_events(&runtime, &filters, &config, events, &cancel).await;
                if let Some(marker) = advance {
                    runtime.advance_position(epoch, marker);
                }
            }
            Ok(None) => break,
            Err(e) => {
                runtime.stats.errors.fetch_add(1, Ordering::Relaxed);
                runtime.set_last_error(Some(e.to_string()));
                metrics::capture_error(&source_id, e.error_code());

                if config.error_tolerance.continues_on_error() {
                    warn!(
                        source_id = %source_id,
                        error = %e,
                        "Capture failed, retrying in {:?}",
                        config.retry_delay()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(config.retry_delay()) => {}
                    }
                    continue;
                }

                error!(source_id = %source_id, error = %e, "Capture failed, stopping source");
                runtime.fail(&e);
                cancel.cancel();
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.poll_interval()) => {}
        }
    }

    info!(source_id = %source_id, "Monitor stopped");
}

/// Capture with up to `retry_attempts` attempts; non-retriable errors fail
/// at once. `Ok(None)` means cancelled.
async fn capture_with_retry(
    connector: &dyn CaptureConnector,
    config: &SourceConfig,
    position: &Position,
    cancel: &CancellationToken,
) -> Result<Option<Vec<ChangeEvent>>> {
    let attempts = config.retry_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = connector.capture(config, position) => result,
        };

        match result {
            Ok(events) => return Ok(Some(events)),
            Err(e) if attempt < attempts && e.is_retriable() => {
                warn!(
                    source_id = %config.id,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Capture attempt failed"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(config.retry_delay()) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Process one capture result. Returns the marker to advance to.
async fn handle_events(
    runtime: &SourceRuntime,
    filters: &FilterChain,
    config: &SourceConfig,
    events: Vec<ChangeEvent>,
    cancel: &CancellationToken,
) -> Option<String> {
    let source_id = runtime.id();
    let mut advance = None;
    let mut captured = 0u64;

    for mut event in events {
        if event.source_id.is_empty() {
            event.source_id = source_id.to_string();
        }
        captured += 1;
        runtime.stats.events_captured.fetch_add(1, Ordering::Relaxed);
        runtime.stats.touch_event();

        let marker = event.position.clone();
        let hash = event.content_hash();
        let duplicate = runtime.dedup.lock().check_and_insert(&hash);

        if duplicate {
            runtime.stats.events_duplicate.fetch_add(1, Ordering::Relaxed);
            metrics::event_duplicate(source_id);
            debug!(source_id = %source_id, event_id = %event.id, "Duplicate event skipped");
        } else if let FilterDecision::Reject { filter_id } = filters.evaluate(&event) {
            runtime.stats.events_filtered.fetch_add(1, Ordering::Relaxed);
            metrics::event_filtered(source_id, &filter_id);
            debug!(
                source_id = %source_id,
                event_id = %event.id,
                filter_id = %filter_id,
                "Event filtered"
            );
        } else if !enqueue(runtime, config, event, &hash, cancel).await {
            // Dropped or cancelled: later markers must not be committed.
            break;
        }

        if let Some(marker) = marker {
            advance = Some(marker);
        }
    }

    if captured > 0 {
        metrics::events_captured(source_id, captured);
        metrics::queue_depth(source_id, runtime.queue.len());
    }
    advance
}

async fn enqueue(
    runtime: &SourceRuntime,
    config: &SourceConfig,
    event: ChangeEvent,
    hash: &str,
    cancel: &CancellationToken,
) -> bool {
    let source_id = runtime.id();
    let accepted = match config.backpressure {
        BackpressureStrategy::DropNewest => match runtime.queue.try_push(event) {
            Ok(()) => true,
            Err(e) => {
                runtime.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::event_dropped(source_id);
                if let CaptureError::QueueFull { capacity, .. } = e {
                    warn!(source_id = %source_id, capacity, "Queue full, dropping event");
                }
                false
            }
        },
        BackpressureStrategy::Block => runtime.queue.push_wait(event, cancel).await,
    };

    if !accepted {
        runtime.dedup.lock().remove(hash);
    }
    accepted
}
