//! Processing loop
//!
//! One per started source. Drains the queue into a [`Batcher`], dispatches
//! flushed batches to the processor registry and checkpoints the position.
//! On exit the partial batch is flushed and the position persisted.

use crate::batch::{Batcher, EventBatch};
use crate::metrics;
use crate::position::PositionStore;
use crate::processor::ProcessorRegistry;
use crate::source::{wait_until_running, SourceRuntime};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Dispatcher<'a> {
    runtime: &'a SourceRuntime,
    processors: &'a ProcessorRegistry,
    store: &'a dyn PositionStore,
    checkpoint_interval: Duration,
    last_checkpoint: Instant,
}

impl Dispatcher<'_> {
    async fn dispatch(&mut self, batch: EventBatch) {
        let report = self.processors.dispatch(&batch).await;
        let source_id = self.runtime.id();

        self.runtime
            .stats
            .events_processed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.runtime.stats.batches.fetch_add(1, Ordering::Relaxed);
        if let Some(marker) = batch.last_position() {
            self.runtime.commit(marker);
        }
        metrics::batch_processed(source_id, batch.len(), batch.wait_time());
        debug!(
            source_id = %source_id,
            sequence = batch.sequence,
            processors_ok = report.succeeded,
            processors_failed = report.failed,
            "Dispatched batch of {} events",
            batch.len()
        );

        if self.last_checkpoint.elapsed() >= self.checkpoint_interval {
            self.checkpoint().await;
        }
    }

    async fn checkpoint(&mut self) {
        self.runtime.persist_position(self.store).await;
        self.last_checkpoint = Instant::now();
    }
}

/// Run the processing loop until cancelled.
pub(crate) async fn run(
    runtime: Arc<SourceRuntime>,
    processors: Arc<ProcessorRegistry>,
    store: Arc<dyn PositionStore>,
    cancel: CancellationToken,
) {
    let config = runtime.config();
    let poll_interval = config.poll_interval();
    let mut batcher = Batcher::new(runtime.id(), config.batch_size, poll_interval);
    let mut dispatcher = Dispatcher {
        runtime: &runtime,
        processors: &processors,
        store: &*store,
        checkpoint_interval: config.checkpoint_interval(),
        last_checkpoint: Instant::now(),
    };
    let mut status = runtime.subscribe();
    info!(source_id = %runtime.id(), "Processing started");

    while wait_until_running(&mut status, &cancel).await {
        let wait = batcher
            .time_until_deadline()
            .map_or(poll_interval, |d| d.min(poll_interval));

        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = runtime.queue.pop_timeout(wait) => next,
        };

        if let Some(event) = next {
            if let Some(batch) = batcher.add(event) {
                dispatcher.dispatch(batch).await;
            }
        }
        if let Some(batch) = batcher.check_timeout() {
            dispatcher.dispatch(batch).await;
        }
    }

    if let Some(batch) = batcher.flush() {
        dispatcher.dispatch(batch).await;
    }
    dispatcher.checkpoint().await;
    metrics::queue_depth(runtime.id(), runtime.queue.len());
    info!(source_id = %runtime.id(), "Processing stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::error::Result;
    use crate::event::ChangeEvent;
    use crate::position::MemoryPositionStore;
    use crate::processor::Processor;
    use crate::source::SourceStatus;
    use parking_lot::Mutex;
    use serde_json::json;

    fn event(n: u64) -> ChangeEvent {
        ChangeEvent::insert("s1", "t", json!({"id": n})).with_position(n.to_string())
    }

    fn recorder(registry: &ProcessorRegistry) -> Arc<Mutex<Vec<(u64, Vec<String>)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        registry
            .add(Processor::from_fn("rec", move |b: &EventBatch| -> Result<()> {
                let markers = b.events.iter().filter_map(|e| e.position.clone()).collect();
                s.lock().push((b.sequence, markers));
                Ok(())
            }))
            .unwrap();
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_and_time_triggers() {
        let rt = Arc::new(SourceRuntime::new(
            SourceConfig::new("s1", "S1", "memory")
                .with_batch_size(3)
                .with_poll_interval(Duration::from_secs(1)),
        ));
        rt.transition(SourceStatus::Starting).unwrap();
        rt.transition(SourceStatus::Running).unwrap();

        let processors = Arc::new(ProcessorRegistry::new());
        let seen = recorder(&processors);
        let store = Arc::new(MemoryPositionStore::new());
        let cancel = CancellationToken::new();

        for n in 1..=5 {
            rt.queue.try_push(event(n)).unwrap();
        }
        let task = tokio::spawn(run(rt.clone(), processors, store.clone(), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0], (1, vec!["1".into(), "2".into(), "3".into()]));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(seen.lock()[1], (2, vec!["4".into(), "5".into()]));
        assert_eq!(rt.stats.snapshot().events_processed, 5);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_partial_batch_and_checkpoints() {
        let rt = Arc::new(SourceRuntime::new(
            SourceConfig::new("s1", "S1", "memory")
                .with_batch_size(10)
                .with_poll_interval(Duration::from_secs(60)),
        ));
        rt.transition(SourceStatus::Starting).unwrap();
        rt.transition(SourceStatus::Running).unwrap();

        let processors = Arc::new(ProcessorRegistry::new());
        let seen = recorder(&processors);
        let store = Arc::new(MemoryPositionStore::new());
        let cancel = CancellationToken::new();

        rt.queue.try_push(event(1)).unwrap();
        rt.queue.try_push(event(2)).unwrap();
        let (_, epoch) = rt.position_with_epoch();
        rt.advance_position(epoch, "2".into());

        let task = tokio::spawn(run(rt.clone(), processors, store.clone(), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen.lock().is_empty());

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].1.len(), 2);
        assert_eq!(store.load("s1").await.unwrap().unwrap().payload, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_source_does_not_dispatch() {
        let rt = Arc::new(SourceRuntime::new(
            SourceConfig::new("s1", "S1", "memory")
                .with_batch_size(1)
                .with_poll_interval(Duration::from_millis(100)),
        ));
        rt.transition(SourceStatus::Starting).unwrap();
        rt.transition(SourceStatus::Running).unwrap();
        rt.transition(SourceStatus::Paused).unwrap();

        let processors = Arc::new(ProcessorRegistry::new());
        let seen = recorder(&processors);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            rt.clone(),
            processors,
            Arc::new(MemoryPositionStore::new()),
            cancel.clone(),
        ));

        rt.queue.try_push(event(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(seen.lock().is_empty());
        assert!(!task.is_finished());

        rt.transition(SourceStatus::Running).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.lock().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
