//! # Capture metrics
//!
//! Emission through the `metrics` facade. Every series is labelled with
//! `source_id`; nothing is recorded unless the host installs a recorder.
//!
//! ## Counters
//!
//! - `rivven_capture_events_captured_total`
//! - `rivven_capture_events_duplicate_total`
//! - `rivven_capture_events_filtered_total` (+ `filter_id`)
//! - `rivven_capture_events_dropped_total`
//! - `rivven_capture_events_processed_total`
//! - `rivven_capture_batches_total`
//! - `rivven_capture_capture_errors_total`
//! - `rivven_capture_processor_failures_total` (+ `processor_id`)
//!
//! ## Gauges
//!
//! - `rivven_capture_queue_depth`
//! - `rivven_capture_source_status` (numeric, see [`SourceStatus::as_code`])
//!
//! ## Histograms
//!
//! - `rivven_capture_batch_wait_seconds`

use crate::source::SourceStatus;
use std::time::Duration;

pub(crate) fn events_captured(source_id: &str, n: u64) {
    ::metrics::counter!(
        "rivven_capture_events_captured_total",
        "source_id" => source_id.to_string()
    )
    .increment(n);
}

pub(crate) fn event_duplicate(source_id: &str) {
    ::metrics::counter!(
        "rivven_capture_events_duplicate_total",
        "source_id" => source_id.to_string()
    )
    .increment(1);
}

pub(crate) fn event_filtered(source_id: &str, filter_id: &str) {
    ::metrics::counter!(
        "rivven_capture_events_filtered_total",
        "source_id" => source_id.to_string(),
        "filter_id" => filter_id.to_string()
    )
    .increment(1);
}

pub(crate) fn event_dropped(source_id: &str) {
    ::metrics::counter!(
        "rivven_capture_events_dropped_total",
        "source_id" => source_id.to_string()
    )
    .increment(1);
}

pub(crate) fn batch_processed(source_id: &str, events: usize, wait: Duration) {
    ::metrics::counter!(
        "rivven_capture_events_processed_total",
        "source_id" => source_id.to_string()
    )
    .increment(events as u64);
    ::metrics::counter!(
        "rivven_capture_batches_total",
        "source_id" => source_id.to_string()
    )
    .increment(1);
    ::metrics::histogram!(
        "rivven_capture_batch_wait_seconds",
        "source_id" => source_id.to_string()
    )
    .record(wait.as_secs_f64());
}

pub(crate) fn capture_error(source_id: &str, error_code: &'static str) {
    ::metrics::counter!(
        "rivven_capture_capture_errors_total",
        "source_id" => source_id.to_string(),
        "code" => error_code
    )
    .increment(1);
}

pub(crate) fn processor_failure(source_id: &str, processor_id: &str) {
    ::metrics::counter!(
        "rivven_capture_processor_failures_total",
        "source_id" => source_id.to_string(),
        "processor_id" => processor_id.to_string()
    )
    .increment(1);
}

pub(crate) fn queue_depth(source_id: &str, depth: usize) {
    ::metrics::gauge!(
        "rivven_capture_queue_depth",
        "source_id" => source_id.to_string()
    )
    .set(depth as f64);
}

pub(crate) fn source_status(source_id: &str, status: SourceStatus) {
    ::metrics::gauge!(
        "rivven_capture_source_status",
        "source_id" => source_id.to_string()
    )
    .set(status.as_code() as f64);
}
