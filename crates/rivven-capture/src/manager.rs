//! Capture manager
//!
//! Facade over every registered source: lifecycle, administration of the
//! shared filter and processor registries, statistics and health.
//!
//! ```rust,ignore
//! let manager = CaptureManager::new(Arc::new(MemoryPositionStore::new()));
//! manager.register_connector("memory", Arc::new(MemoryConnector::new()));
//! manager.add_source(SourceConfig::new("orders", "Orders", "memory"))?;
//! manager.add_processor(Processor::from_fn("log", |batch| {
//!     println!("{} events", batch.len());
//!     Ok(())
//! }))?;
//! manager.start_source("orders").await?;
//! ```

use crate::config::{EngineConfig, SourceConfig, SourceConfigUpdate};
use crate::connector::{CaptureConnector, ConnectorRegistry};
use crate::error::{CaptureError, Result};
use crate::filter::{Filter, FilterChain};
use crate::health::{HealthMonitor, HealthSnapshot, HealthThresholds};
use crate::metrics;
use crate::monitor;
use crate::position::{open_store, Position, SharedPositionStore};
use crate::processing;
use crate::processor::{Processor, ProcessorRegistry, ProcessorStatsSnapshot};
use crate::source::{
    SourceRuntime, SourceStatus, SourceStatusSnapshot, SourceTasks, StatisticsSnapshot,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub total_sources: usize,
    pub active_sources: usize,
    pub errored_sources: usize,
    /// Counters summed over all sources
    pub totals: StatisticsSnapshot,
    pub queued_events: usize,
    pub filters: usize,
    pub sources: BTreeMap<String, StatisticsSnapshot>,
    pub processors: BTreeMap<String, ProcessorStatsSnapshot>,
    pub timestamp: DateTime<Utc>,
}

/// Multi-source capture engine.
pub struct CaptureManager {
    sources: RwLock<HashMap<String, Arc<SourceRuntime>>>,
    connectors: RwLock<ConnectorRegistry>,
    filters: Arc<FilterChain>,
    processors: Arc<ProcessorRegistry>,
    store: SharedPositionStore,
    health: Arc<HealthMonitor>,
}

impl CaptureManager {
    pub fn new(store: SharedPositionStore) -> Self {
        Self::with_connectors(ConnectorRegistry::new(), store)
    }

    pub fn with_connectors(connectors: ConnectorRegistry, store: SharedPositionStore) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            connectors: RwLock::new(connectors),
            filters: Arc::new(FilterChain::new()),
            processors: Arc::new(ProcessorRegistry::new()),
            store,
            health: Arc::new(HealthMonitor::default()),
        }
    }

    /// Replace the health thresholds.
    pub fn with_health_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.health = Arc::new(HealthMonitor::new(thresholds));
        self
    }

    /// Build a manager from a validated configuration document.
    ///
    /// Sources are registered but not started.
    pub fn from_config(
        config: EngineConfig,
        connectors: ConnectorRegistry,
        store: SharedPositionStore,
    ) -> Result<Self> {
        config.validate()?;
        let manager =
            Self::with_connectors(connectors, store).with_health_thresholds(config.health);
        for filter in config.filters {
            manager.add_filter(filter)?;
        }
        for source in config.sources {
            manager.add_source(source)?;
        }
        Ok(manager)
    }

    /// Like [`from_config`](Self::from_config), opening the configured
    /// position store.
    pub async fn open(config: EngineConfig, connectors: ConnectorRegistry) -> Result<Self> {
        let store = open_store(&config.position_store).await?;
        Self::from_config(config, connectors, store)
    }

    /// Register the connector serving `source_type`.
    pub fn register_connector(&self, source_type: &str, connector: Arc<dyn CaptureConnector>) {
        self.connectors.write().register(source_type, connector);
        debug!(source_type, "Registered capture connector");
    }

    pub fn position_store(&self) -> &SharedPositionStore {
        &self.store
    }

    fn runtime(&self, id: &str) -> Result<Arc<SourceRuntime>> {
        self.sources
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CaptureError::UnknownSource(id.to_string()))
    }

    fn connector_for(&self, config: &SourceConfig) -> Result<Arc<dyn CaptureConnector>> {
        self.connectors
            .read()
            .get(&config.source_type)
            .cloned()
            .ok_or_else(|| {
                CaptureError::config(format!(
                    "no connector registered for source type '{}'",
                    config.source_type
                ))
            })
    }

    // ------------------------------------------------------------------
    // Source registration
    // ------------------------------------------------------------------

    /// Register a source in the `Stopped` state.
    pub fn add_source(&self, config: SourceConfig) -> Result<()> {
        config.check()?;
        if let Some(connector) = self.connectors.read().get(&config.source_type) {
            connector.validate_config(&config)?;
        }

        let mut sources = self.sources.write();
        if sources.contains_key(&config.id) {
            return Err(CaptureError::DuplicateSource(config.id));
        }
        let id = config.id.clone();
        info!(source_id = %id, source_type = %config.source_type, "Source added");
        metrics::source_status(&id, SourceStatus::Stopped);
        sources.insert(id, Arc::new(SourceRuntime::new(config)));
        Ok(())
    }

    /// Stop (if needed) and unregister a source. Its stored position is kept.
    pub async fn remove_source(&self, id: &str) -> Result<()> {
        self.stop_source(id).await?;
        self.sources.write().remove(id);
        info!(source_id = %id, "Source removed");
        Ok(())
    }

    /// Update the mutable parts of a source's config.
    ///
    /// Queue capacity applies immediately; other performance knobs take
    /// effect at the next start.
    pub fn update_source(&self, id: &str, update: SourceConfigUpdate) -> Result<SourceConfig> {
        let runtime = self.runtime(id)?;
        runtime.update_config(|config| config.apply(update))?;
        info!(source_id = %id, "Source config updated");
        Ok(runtime.config())
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Restore the position and spawn the monitor and processing loops.
    pub async fn start_source(&self, id: &str) -> Result<()> {
        let runtime = self.runtime(id)?;
        let config = runtime.config();
        let connector = self.connector_for(&config)?;
        connector.validate_config(&config)?;

        let mut tasks = runtime.tasks.lock().await;
        if runtime.status() == SourceStatus::Error {
            // Reap the loops of the failed run before starting new ones.
            if let Some(stale) = tasks.take() {
                stale.shutdown().await;
            }
        }
        runtime.transition(SourceStatus::Starting)?;

        let position = match self.store.load(id).await {
            Ok(Some(position)) => {
                info!(source_id = %id, "Resuming from position {}", position.payload);
                position
            }
            Ok(None) => {
                let position = Position::initial(id, &config.initial_position);
                info!(source_id = %id, "No stored position, starting at {}", position.payload);
                position
            }
            Err(e) => {
                runtime.fail(&e);
                return Err(e);
            }
        };
        runtime.prepare_start(position);
        runtime.transition(SourceStatus::Running)?;

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor::run(
            runtime.clone(),
            connector,
            self.filters.clone(),
            cancel.clone(),
        ));
        let processing = tokio::spawn(processing::run(
            runtime.clone(),
            self.processors.clone(),
            self.store.clone(),
            cancel.clone(),
        ));
        *tasks = Some(SourceTasks {
            cancel,
            monitor,
            processing,
        });
        Ok(())
    }

    /// Cancel both loops, wait for them, persist the position.
    ///
    /// Stopping a stopped source is a no-op.
    pub async fn stop_source(&self, id: &str) -> Result<()> {
        let runtime = self.runtime(id)?;
        let mut tasks = runtime.tasks.lock().await;
        if runtime.status() == SourceStatus::Stopped {
            return Ok(());
        }

        runtime.transition(SourceStatus::Stopping)?;
        if let Some(running) = tasks.take() {
            running.shutdown().await;
        }
        runtime.persist_position(&*self.store).await;
        runtime.transition(SourceStatus::Stopped)?;
        metrics::queue_depth(id, runtime.queue.len());
        Ok(())
    }

    /// Suspend capture and dispatch; both loops stay alive.
    pub async fn pause_source(&self, id: &str) -> Result<()> {
        let runtime = self.runtime(id)?;
        let _tasks = runtime.tasks.lock().await;
        runtime.transition(SourceStatus::Paused)?;
        Ok(())
    }

    pub async fn resume_source(&self, id: &str) -> Result<()> {
        let runtime = self.runtime(id)?;
        let _tasks = runtime.tasks.lock().await;
        if runtime.status() != SourceStatus::Paused {
            return Err(CaptureError::invalid_state(format!(
                "source '{}' is {}, not paused",
                id,
                runtime.status()
            )));
        }
        runtime.transition(SourceStatus::Running)?;
        Ok(())
    }

    /// Start every stopped or failed source. Returns the ids that failed to
    /// start with their errors.
    pub async fn start_all(&self) -> Vec<(String, CaptureError)> {
        let mut failures = Vec::new();
        for id in self.source_ids() {
            let Ok(runtime) = self.runtime(&id) else {
                continue;
            };
            if runtime.status().is_active() {
                continue;
            }
            if let Err(e) = self.start_source(&id).await {
                warn!(source_id = %id, error = %e, "Failed to start source");
                failures.push((id, e));
            }
        }
        failures
    }

    /// Stop every source.
    pub async fn stop_all(&self) -> Vec<(String, CaptureError)> {
        let mut failures = Vec::new();
        for id in self.source_ids() {
            if let Err(e) = self.stop_source(&id).await {
                warn!(source_id = %id, error = %e, "Failed to stop source");
                failures.push((id, e));
            }
        }
        failures
    }

    /// Overwrite a source's position with `payload`, or with its initial
    /// policy when `None`, and persist it. Clears the dedup set so replayed
    /// events are delivered again.
    pub async fn reset_position(&self, id: &str, payload: Option<String>) -> Result<Position> {
        let runtime = self.runtime(id)?;
        let _tasks = runtime.tasks.lock().await;
        let status = runtime.status();
        if matches!(status, SourceStatus::Starting | SourceStatus::Stopping) {
            return Err(CaptureError::invalid_state(format!(
                "cannot reset position of source '{}' while {}",
                id, status
            )));
        }

        let position = match payload {
            Some(payload) => Position::new(id, payload),
            None => Position::initial(id, &runtime.config().initial_position),
        };
        runtime.reset_position(position.clone());
        self.store.save(&position).await?;
        info!(source_id = %id, "Position reset to {}", position.payload);
        Ok(position)
    }

    // ------------------------------------------------------------------
    // Filters and processors
    // ------------------------------------------------------------------

    pub fn add_filter(&self, filter: Filter) -> Result<()> {
        let id = filter.id.clone();
        self.filters.add(filter)?;
        info!(filter_id = %id, "Filter added");
        Ok(())
    }

    pub fn remove_filter(&self, id: &str) -> Result<Filter> {
        let removed = self.filters.remove(id)?;
        info!(filter_id = %id, "Filter removed");
        Ok(removed)
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.filters.list()
    }

    pub fn add_processor(&self, processor: Processor) -> Result<()> {
        let id = processor.id.clone();
        self.processors.add(processor)?;
        info!(processor_id = %id, "Processor added");
        Ok(())
    }

    pub fn remove_processor(&self, id: &str) -> Result<Processor> {
        let removed = self.processors.remove(id)?;
        info!(processor_id = %id, "Processor removed");
        Ok(removed)
    }

    pub fn processor_ids(&self) -> Vec<String> {
        self.processors.ids()
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub fn get_source_status(&self, id: &str) -> Result<SourceStatusSnapshot> {
        Ok(self.runtime(id)?.snapshot())
    }

    /// Status of every source, ordered by id.
    pub fn get_all_statuses(&self) -> Vec<SourceStatusSnapshot> {
        let mut statuses: Vec<SourceStatusSnapshot> =
            self.sources.read().values().map(|r| r.snapshot()).collect();
        statuses.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        statuses
    }

    pub fn get_statistics(&self) -> EngineStatistics {
        let statuses = self.get_all_statuses();
        let mut totals = StatisticsSnapshot::default();
        let mut sources = BTreeMap::new();

        for status in &statuses {
            let s = &status.statistics;
            totals.events_captured += s.events_captured;
            totals.events_processed += s.events_processed;
            totals.events_filtered += s.events_filtered;
            totals.duplicates += s.duplicates;
            totals.dropped += s.dropped;
            totals.expired += s.expired;
            totals.batches += s.batches;
            totals.errors += s.errors;
            totals.last_event_time = totals.last_event_time.max(s.last_event_time);
            totals.start_time = match (totals.start_time, s.start_time) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            sources.insert(status.source_id.clone(), s.clone());
        }

        EngineStatistics {
            total_sources: statuses.len(),
            active_sources: statuses.iter().filter(|s| s.status.is_active()).count(),
            errored_sources: statuses
                .iter()
                .filter(|s| s.status == SourceStatus::Error)
                .count(),
            totals,
            queued_events: statuses.iter().map(|s| s.queue_size).sum(),
            filters: self.filters.len(),
            sources,
            processors: self.processors.stats().into_iter().collect(),
            timestamp: Utc::now(),
        }
    }

    /// Evaluate and cache engine health.
    pub fn health_check(&self) -> HealthSnapshot {
        let snapshot = self.health.evaluate(&self.get_all_statuses());
        self.health.record(snapshot)
    }

    /// Latest health snapshot from [`health_check`](Self::health_check) or the
    /// periodic monitor.
    pub fn latest_health(&self) -> Option<HealthSnapshot> {
        self.health.latest()
    }

    /// Re-evaluate health every `every` until `cancel` fires.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        self.health.clone().spawn_periodic(
            every,
            move || {
                manager
                    .upgrade()
                    .map(|m| m.get_all_statuses())
                    .unwrap_or_default()
            },
            cancel,
        )
    }

    /// Expire queued, undispatched events older than `retention_hours` from
    /// every source and expire old recency-tracked dedup entries. Returns the
    /// number of expired events.
    ///
    /// Expired events leave memory but are not lost: a source holding any
    /// flushes its whole queue and rewinds to its last dispatched marker, so
    /// the monitor captures them again on its next poll.
    pub fn cleanup_old_events(&self, retention_hours: u64) -> usize {
        let retention = Duration::from_secs(retention_hours.saturating_mul(3600));
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let runtimes: Vec<Arc<SourceRuntime>> = self.sources.read().values().cloned().collect();
        let mut removed = 0;
        for runtime in runtimes {
            let expired = runtime.expire_queued(cutoff);
            let forgotten = runtime.dedup.lock().expire_older_than(retention);
            if expired > 0 || forgotten > 0 {
                metrics::queue_depth(runtime.id(), runtime.queue.len());
                info!(
                    source_id = %runtime.id(),
                    expired,
                    dedup_expired = forgotten,
                    "Cleaned up events older than {}h",
                    retention_hours
                );
            }
            removed += expired;
        }
        removed
    }
}

impl std::fmt::Debug for CaptureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureManager")
            .field("sources", &self.source_ids())
            .field("filters", &self.filters.len())
            .field("processors", &self.processors.len())
            .finish()
    }
}
