//! # Health aggregation
//!
//! Classifies the engine from per-source status reports.
//!
//! ## Rules
//!
//! - A source in `Error` is an issue and makes the engine **unhealthy**
//! - A running source with no event for longer than the staleness threshold
//!   (measured from start when nothing has been captured) is a warning
//! - A queue filled above the high watermark is a warning
//! - Any warning without an `Error` source makes the engine **degraded**
//!
//! [`HealthMonitor::spawn_periodic`] re-evaluates on an interval, caches the
//! latest snapshot and logs status transitions.

use crate::error::{CaptureError, Result};
use crate::source::{SourceStatus, SourceStatusSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Seconds without events before a running source is stale
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
    /// Queue fill ratio above which a warning is raised
    #[serde(default = "default_queue_high_watermark")]
    pub queue_high_watermark: f64,
}

fn default_staleness_threshold_secs() -> u64 {
    300
}

fn default_queue_high_watermark() -> f64 {
    0.8
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: default_staleness_threshold_secs(),
            queue_high_watermark: default_queue_high_watermark(),
        }
    }
}

impl HealthThresholds {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.staleness_threshold_secs == 0 {
            return Err(CaptureError::config(
                "health.staleness_threshold_secs must be greater than zero",
            ));
        }
        if !(self.queue_high_watermark > 0.0 && self.queue_high_watermark <= 1.0) {
            return Err(CaptureError::config(
                "health.queue_high_watermark must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

/// Overall engine health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub status: SourceStatus,
    pub warnings: Vec<String>,
    pub queue_ratio: f64,
    pub seconds_since_last_event: Option<i64>,
}

/// Engine health report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub sources: BTreeMap<String, SourceHealth>,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Get health as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Health aggregator with a cached latest snapshot.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    latest: RwLock<Option<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            latest: RwLock::new(None),
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Classify `sources` as of now.
    pub fn evaluate(&self, sources: &[SourceStatusSnapshot]) -> HealthSnapshot {
        self.evaluate_at(sources, Utc::now())
    }

    /// Classify `sources` as of `now`.
    pub fn evaluate_at(&self, sources: &[SourceStatusSnapshot], now: DateTime<Utc>) -> HealthSnapshot {
        let staleness = self.thresholds.staleness_threshold_secs as i64;
        let mut issues = Vec::new();
        let mut per_source = BTreeMap::new();
        let mut any_error = false;

        for source in sources {
            let mut warnings = Vec::new();

            if source.status == SourceStatus::Error {
                any_error = true;
                warnings.push(format!(
                    "source in error state: {}",
                    source.last_error.as_deref().unwrap_or("unknown error")
                ));
            }

            let since_last = source
                .statistics
                .last_event_time
                .map(|t| (now - t).num_seconds());
            if source.status == SourceStatus::Running {
                let reference = source
                    .statistics
                    .last_event_time
                    .or(source.statistics.start_time);
                if let Some(reference) = reference {
                    let idle = (now - reference).num_seconds();
                    if idle > staleness {
                        warnings.push(format!("no events for {}s", idle));
                    }
                }
            }

            let queue_ratio = if source.queue_max_size == 0 {
                0.0
            } else {
                source.queue_size as f64 / source.queue_max_size as f64
            };
            if queue_ratio > self.thresholds.queue_high_watermark {
                warnings.push(format!(
                    "queue at {:.0}% ({}/{})",
                    queue_ratio * 100.0,
                    source.queue_size,
                    source.queue_max_size
                ));
            }

            issues.extend(
                warnings
                    .iter()
                    .map(|w| format!("source '{}': {}", source.source_id, w)),
            );
            per_source.insert(
                source.source_id.clone(),
                SourceHealth {
                    status: source.status,
                    warnings,
                    queue_ratio,
                    seconds_since_last_event: since_last,
                },
            );
        }

        let status = if any_error {
            HealthStatus::Unhealthy
        } else if !issues.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthSnapshot {
            status,
            sources: per_source,
            issues,
            timestamp: now,
        }
    }

    /// Cache `snapshot`, logging a status transition.
    pub fn record(&self, snapshot: HealthSnapshot) -> HealthSnapshot {
        let previous = self.latest.write().replace(snapshot.clone());
        let previous_status = previous.map(|s| s.status);

        if previous_status != Some(snapshot.status) {
            match snapshot.status {
                HealthStatus::Healthy => info!("Capture engine healthy"),
                status => warn!(
                    issues = snapshot.issues.len(),
                    "Capture engine {}: {}",
                    status,
                    snapshot.issues.join("; ")
                ),
            }
        }
        snapshot
    }

    /// Latest cached snapshot.
    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.latest.read().clone()
    }

    /// Re-evaluate every `every` until cancelled.
    pub fn spawn_periodic<F>(
        self: Arc<Self>,
        every: Duration,
        sources: F,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Vec<SourceStatusSnapshot> + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = self.evaluate(&sources());
                        self.record(snapshot);
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }
}
