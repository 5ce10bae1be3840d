//! Downstream batch processors
//!
//! A [`Processor`] wraps a [`BatchHandler`] with an id, an enabled flag, an
//! optional timeout and its own statistics. Processors are global and are
//! invoked in registration order with every flushed batch of every source.
//!
//! Failures are isolated: an error or timeout in one processor is logged and
//! counted on that processor only; the others still receive the batch.

use crate::batch::EventBatch;
use crate::error::{CaptureError, Result};
use crate::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Consumer of event batches.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: &EventBatch) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> BatchHandler for FnHandler<F>
where
    F: Fn(&EventBatch) -> Result<()> + Send + Sync,
{
    async fn handle(&self, batch: &EventBatch) -> Result<()> {
        (self.0)(batch)
    }
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> BatchHandler for AsyncFnHandler<F>
where
    F: Fn(EventBatch) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, batch: &EventBatch) -> Result<()> {
        (self.0)(batch.clone()).await
    }
}

/// Informational batching preferences of a processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHints {
    pub preferred_batch_size: Option<usize>,
    pub max_wait_ms: Option<u64>,
}

/// Per-processor statistics.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub batches_ok: AtomicU64,
    pub events_ok: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl ProcessorStats {
    fn record_success(&self, events: usize) {
        self.batches_ok.fetch_add(1, Ordering::Relaxed);
        self.events_ok.fetch_add(events as u64, Ordering::Relaxed);
        *self.last_success.lock() = Some(Utc::now());
    }

    fn record_failure(&self, error: &CaptureError) {
        if matches!(error, CaptureError::Timeout(_)) {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            batches_ok: self.batches_ok.load(Ordering::Relaxed),
            events_ok: self.events_ok.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
            last_success: *self.last_success.lock(),
        }
    }
}

/// Snapshot of processor statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorStatsSnapshot {
    pub batches_ok: u64,
    pub events_ok: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

/// A registered downstream consumer.
#[derive(Clone)]
pub struct Processor {
    pub id: String,
    pub hints: BatchHints,
    pub enabled: bool,
    pub timeout: Option<Duration>,
    handler: Arc<dyn BatchHandler>,
    stats: Arc<ProcessorStats>,
}

impl Processor {
    pub fn new(id: impl Into<String>, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            id: id.into(),
            hints: BatchHints::default(),
            enabled: true,
            timeout: None,
            handler,
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    /// Wrap a synchronous closure.
    pub fn from_fn<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&EventBatch) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(id, Arc::new(FnHandler(f)))
    }

    /// Wrap a closure returning a future. The closure receives its own copy
    /// of the batch.
    pub fn from_async<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(EventBatch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(id, Arc::new(AsyncFnHandler(f)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_hints(mut self, hints: BatchHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CaptureError::invalid_processor(&self.id, "id must not be empty"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(CaptureError::invalid_processor(
                &self.id,
                "timeout must be greater than zero",
            ));
        }
        Ok(())
    }

    async fn invoke(&self, batch: &EventBatch) -> Result<()> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.handler.handle(batch))
                .await
                .map_err(|_| {
                    CaptureError::timeout(format!(
                        "processor '{}' exceeded {:?}",
                        self.id, timeout
                    ))
                })?,
            None => self.handler.handle(batch).await,
        }
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .field("hints", &self.hints)
            .finish()
    }
}

/// Result of dispatching one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Ordered, copy-on-write processor registry.
#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    processors: RwLock<Arc<Vec<Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor at the end of the dispatch order.
    pub fn add(&self, processor: Processor) -> Result<()> {
        processor.validate()?;
        let mut guard = self.processors.write();
        if guard.iter().any(|p| p.id == processor.id) {
            return Err(CaptureError::DuplicateProcessor(processor.id));
        }
        let mut next = guard.as_ref().clone();
        next.push(processor);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Unregister a processor.
    pub fn remove(&self, id: &str) -> Result<Processor> {
        let mut guard = self.processors.write();
        let Some(idx) = guard.iter().position(|p| p.id == id) else {
            return Err(CaptureError::UnknownProcessor(id.to_string()));
        };
        let mut next = guard.as_ref().clone();
        let removed = next.remove(idx);
        *guard = Arc::new(next);
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Processor> {
        self.processors.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.processors.read().iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.processors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics of every registered processor, in dispatch order.
    pub fn stats(&self) -> Vec<(String, ProcessorStatsSnapshot)> {
        self.processors
            .read()
            .iter()
            .map(|p| (p.id.clone(), p.stats()))
            .collect()
    }

    /// Hand `batch` to every enabled processor in order.
    pub async fn dispatch(&self, batch: &EventBatch) -> DispatchReport {
        let snapshot = self.processors.read().clone();
        let mut report = DispatchReport::default();

        for processor in snapshot.iter().filter(|p| p.enabled) {
            match processor.invoke(batch).await {
                Ok(()) => {
                    processor.stats.record_success(batch.len());
                    report.succeeded += 1;
                    debug!(
                        source_id = %batch.source_id,
                        processor_id = %processor.id,
                        sequence = batch.sequence,
                        "Batch of {} events processed",
                        batch.len()
                    );
                }
                Err(e) => {
                    processor.stats.record_failure(&e);
                    report.failed += 1;
                    metrics::processor_failure(&batch.source_id, &processor.id);
                    warn!(
                        source_id = %batch.source_id,
                        processor_id = %processor.id,
                        sequence = batch.sequence,
                        error = %e,
                        "Processor failed"
                    );
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batcher;
    use crate::event::ChangeEvent;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn batch(n: usize) -> EventBatch {
        let mut batcher = Batcher::new("s1", n, Duration::from_secs(1));
        let mut out = None;
        for i in 0..n {
            out = batcher.add(ChangeEvent::insert("s1", "t", json!({"id": i})));
        }
        out.unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_in_order() {
        let registry = ProcessorRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in ["a", "b", "c"] {
            let order = order.clone();
            registry
                .add(Processor::from_fn(id, move |_| {
                    order.lock().push(id);
                    Ok(())
                }))
                .unwrap();
        }

        let report = registry.dispatch(&batch(2)).await;
        assert_eq!(report.succeeded, 3);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let registry = ProcessorRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));

        registry
            .add(Processor::from_fn("broken", |_| {
                Err(CaptureError::processor("broken", "sink unavailable"))
            }))
            .unwrap();
        let s = seen.clone();
        registry
            .add(Processor::from_fn("ok", move |b| {
                s.fetch_add(b.len(), Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        let report = registry.dispatch(&batch(3)).await;
        assert_eq!(report, DispatchReport { succeeded: 1, failed: 1 });
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        let broken = registry.get("broken").unwrap().stats();
        assert_eq!(broken.failures, 1);
        assert!(broken.last_error.unwrap().contains("sink unavailable"));

        let ok = registry.get("ok").unwrap().stats();
        assert_eq!(ok.batches_ok, 1);
        assert_eq!(ok.events_ok, 3);
        assert!(ok.last_success.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_counted() {
        let registry = ProcessorRegistry::new();
        registry
            .add(
                Processor::from_async("slow", |_batch| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .with_timeout(Duration::from_secs(1)),
            )
            .unwrap();

        let report = registry.dispatch(&batch(1)).await;
        assert_eq!(report.failed, 1);

        let stats = registry.get("slow").unwrap().stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_disabled_processor_skipped() {
        let registry = ProcessorRegistry::new();
        registry
            .add(Processor::from_fn("off", |_| Ok(())).with_enabled(false))
            .unwrap();

        let report = registry.dispatch(&batch(1)).await;
        assert_eq!(report, DispatchReport::default());
        assert_eq!(registry.get("off").unwrap().stats().batches_ok, 0);
    }

    #[test]
    fn test_registry_admin() {
        let registry = ProcessorRegistry::new();
        registry.add(Processor::from_fn("a", |_| Ok(()))).unwrap();

        assert!(matches!(
            registry.add(Processor::from_fn("a", |_| Ok(()))),
            Err(CaptureError::DuplicateProcessor(_))
        ));
        assert!(matches!(
            registry.add(Processor::from_fn("", |_| Ok(()))),
            Err(CaptureError::InvalidProcessor { .. })
        ));
        assert!(matches!(
            registry.add(Processor::from_fn("z", |_| Ok(())).with_timeout(Duration::ZERO)),
            Err(CaptureError::InvalidProcessor { .. })
        ));

        assert_eq!(registry.ids(), vec!["a"]);
        registry.remove("a").unwrap();
        assert!(matches!(
            registry.remove("a"),
            Err(CaptureError::UnknownProcessor(_))
        ));
        assert!(registry.is_empty());
    }
}
