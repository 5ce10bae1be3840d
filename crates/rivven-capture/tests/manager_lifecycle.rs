//! Source lifecycle through the manager: start/stop, pause/resume, error
//! tolerance, restart from a stored position, and health.
//!
//! Run with: cargo test -p rivven-capture --test manager_lifecycle -- --nocapture

use parking_lot::Mutex;
use rivven_capture::testing::MemoryConnector;
use rivven_capture::{
    CaptureManager, ChangeEvent, EngineConfig, ErrorTolerance, EventBatch, FilePositionStore,
    HealthStatus, InitialPosition, MemoryPositionStore, PositionStore, Processor, SourceConfig,
    SourceStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rivven_capture=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Records the position markers of every dispatched event.
#[derive(Clone, Default)]
struct Recorder {
    markers: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn processor(&self, id: &str) -> Processor {
        let markers = self.markers.clone();
        Processor::from_fn(id, move |batch: &EventBatch| {
            markers
                .lock()
                .extend(batch.events.iter().filter_map(|e| e.position.clone()));
            Ok(())
        })
    }

    fn markers(&self) -> Vec<String> {
        self.markers.lock().clone()
    }

    fn count(&self) -> usize {
        self.markers.lock().len()
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn row(id: u64) -> ChangeEvent {
    ChangeEvent::insert("", "users", json!({"id": id, "name": format!("user-{}", id)}))
}

fn source(id: &str) -> SourceConfig {
    SourceConfig::new(id, id, "memory")
        .with_initial_position(InitialPosition::Earliest)
        .with_batch_size(10)
        .with_poll_interval(Duration::from_millis(100))
        .with_retry(2, Duration::from_millis(10))
}

fn setup(connector: Arc<MemoryConnector>) -> (CaptureManager, Recorder) {
    init_tracing();
    let manager = CaptureManager::new(Arc::new(MemoryPositionStore::new()));
    manager.register_connector("memory", connector);
    let recorder = Recorder::default();
    manager.add_processor(recorder.processor("recorder")).unwrap();
    (manager, recorder)
}

#[tokio::test(start_paused = true)]
async fn test_capture_and_dispatch() {
    let connector = Arc::new(MemoryConnector::new().with_events((1..=5).map(row).collect()));
    let (manager, recorder) = setup(connector);
    manager.add_source(source("users")).unwrap();

    manager.start_source("users").await.unwrap();
    wait_until("5 events", || recorder.count() == 5).await;

    let status = manager.get_source_status("users").unwrap();
    assert_eq!(status.status, SourceStatus::Running);
    assert_eq!(status.statistics.events_captured, 5);
    assert_eq!(status.statistics.events_processed, 5);
    assert_eq!(status.position, "5");
    assert!(status.statistics.start_time.is_some());
    assert!(status.statistics.last_event_time.is_some());

    manager.stop_source("users").await.unwrap();
    let stored = manager.position_store().load("users").await.unwrap().unwrap();
    assert_eq!(stored.payload, "5");
    assert_eq!(recorder.markers(), vec!["1", "2", "3", "4", "5"]);
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume_keep_loops_alive() {
    let connector = Arc::new(MemoryConnector::new().with_events(vec![row(1)]));
    let (manager, recorder) = setup(connector.clone());
    manager.add_source(source("users")).unwrap();

    manager.start_source("users").await.unwrap();
    wait_until("first event", || recorder.count() == 1).await;

    manager.pause_source("users").await.unwrap();
    let calls = connector.capture_calls();
    connector.push(row(2));
    sleep(Duration::from_secs(2)).await;
    assert_eq!(recorder.count(), 1);
    assert!(connector.capture_calls() <= calls + 1);

    manager.resume_source("users").await.unwrap();
    wait_until("event after resume", || recorder.count() == 2).await;
    assert_eq!(recorder.markers(), vec!["1", "2"]);

    manager.stop_source("users").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_then_explicit_restart() {
    let connector = Arc::new(MemoryConnector::new().with_events(vec![row(1)]));
    connector.fail_next(2, "connection refused");
    let (manager, recorder) = setup(connector);
    manager.add_source(source("users")).unwrap();
    manager.add_source(source("idle")).unwrap();

    manager.start_source("users").await.unwrap();
    wait_until("error state", || {
        manager.get_source_status("users").unwrap().status == SourceStatus::Error
    })
    .await;

    let status = manager.get_source_status("users").unwrap();
    assert_eq!(status.statistics.errors, 1);
    assert!(status.last_error.unwrap().contains("connection refused"));
    assert_eq!(recorder.count(), 0);

    let health = manager.health_check();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.issues.len(), 1);
    assert!(health.issues[0].contains("users"));
    assert!(health.sources["idle"].warnings.is_empty());

    // No automatic recovery; restarting is an explicit operation.
    manager.start_source("users").await.unwrap();
    wait_until("event after restart", || recorder.count() == 1).await;
    assert_eq!(manager.health_check().status, HealthStatus::Healthy);
    assert!(manager.get_source_status("users").unwrap().last_error.is_none());

    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_error_tolerance_all_keeps_capturing() {
    let connector = Arc::new(MemoryConnector::new().with_events(vec![row(1), row(2)]));
    connector.fail_next(3, "flaky");
    let (manager, recorder) = setup(connector);
    manager
        .add_source(
            source("users")
                .with_retry(1, Duration::from_millis(50))
                .with_error_tolerance(ErrorTolerance::All),
        )
        .unwrap();

    manager.start_source("users").await.unwrap();
    wait_until("events after failures", || recorder.count() == 2).await;

    let status = manager.get_source_status("users").unwrap();
    assert_eq!(status.status, SourceStatus::Running);
    assert_eq!(status.statistics.errors, 3);
    assert_eq!(manager.health_check().status, HealthStatus::Healthy);

    manager.stop_source("users").await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_from_stored_position() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(MemoryConnector::new().with_events((1..=3).map(row).collect()));

    let first_run = Recorder::default();
    {
        let store = Arc::new(FilePositionStore::new(dir.path()).await.unwrap());
        let manager = CaptureManager::new(store);
        manager.register_connector("memory", connector.clone());
        manager.add_processor(first_run.processor("recorder")).unwrap();
        manager.add_source(source("users")).unwrap();

        manager.start_source("users").await.unwrap();
        wait_until("first run", || first_run.count() == 3).await;
        manager.stop_source("users").await.unwrap();
    }
    assert_eq!(first_run.markers(), vec!["1", "2", "3"]);

    connector.push(row(4));
    connector.push(row(5));

    // A fresh manager (new dedup state) over the same directory.
    let second_run = Recorder::default();
    let store = Arc::new(FilePositionStore::new(dir.path()).await.unwrap());
    assert_eq!(store.load("users").await.unwrap().unwrap().payload, "3");

    let manager = CaptureManager::new(store);
    manager.register_connector("memory", connector);
    manager.add_processor(second_run.processor("recorder")).unwrap();
    manager.add_source(source("users")).unwrap();

    manager.start_source("users").await.unwrap();
    wait_until("second run", || second_run.count() == 2).await;
    sleep(Duration::from_millis(300)).await;
    manager.stop_source("users").await.unwrap();

    assert_eq!(second_run.markers(), vec!["4", "5"]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_position_replays() {
    let connector = Arc::new(MemoryConnector::new().with_events((1..=3).map(row).collect()));
    let (manager, recorder) = setup(connector);
    manager.add_source(source("users")).unwrap();

    manager.start_source("users").await.unwrap();
    wait_until("initial delivery", || recorder.count() == 3).await;

    let position = manager.reset_position("users", Some("1".into())).await.unwrap();
    assert_eq!(position.payload, "1");
    assert_eq!(
        manager.position_store().load("users").await.unwrap().unwrap().payload,
        "1"
    );

    wait_until("replay", || recorder.count() == 5).await;
    assert_eq!(recorder.markers(), vec!["1", "2", "3", "2", "3"]);

    manager.stop_source("users").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_expired_events_are_captured_again() {
    let old = chrono::Utc::now() - chrono::Duration::hours(48);
    let connector = Arc::new(
        MemoryConnector::new().with_events((1..=6).map(|n| row(n).with_timestamp(old)).collect()),
    );
    let (manager, recorder) = setup(connector);

    // Hold the first batch so the rest stays queued.
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let first = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let held = {
        let gate = gate.clone();
        Processor::from_async("held", move |_batch: EventBatch| {
            let gate = gate.clone();
            let first = first.clone();
            async move {
                if first.swap(false, std::sync::atomic::Ordering::SeqCst) {
                    let _ = gate.acquire().await;
                }
                Ok(())
            }
        })
    };
    manager.add_processor(held).unwrap();
    manager.add_source(source("users").with_batch_size(1)).unwrap();

    manager.start_source("users").await.unwrap();
    wait_until("backlog", || {
        manager.get_source_status("users").unwrap().queue_size == 5
    })
    .await;

    assert_eq!(manager.cleanup_old_events(24), 5);
    gate.add_permits(1);

    wait_until("replayed events", || recorder.count() == 6).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.markers(), vec!["1", "2", "3", "4", "5", "6"]);

    let status = manager.get_source_status("users").unwrap();
    assert_eq!(status.statistics.expired, 5);
    assert!(status.statistics.duplicates >= 1);

    manager.stop_source("users").await.unwrap();
    let stored = manager.position_store().load("users").await.unwrap().unwrap();
    assert_eq!(stored.payload, "6");
}

#[tokio::test(start_paused = true)]
async fn test_restart_clears_last_event_time() {
    let connector = Arc::new(MemoryConnector::new().with_events(vec![row(1)]));
    let (manager, recorder) = setup(connector);
    manager.add_source(source("users")).unwrap();

    manager.start_source("users").await.unwrap();
    wait_until("delivery", || recorder.count() == 1).await;
    manager.stop_source("users").await.unwrap();
    assert!(manager
        .get_source_status("users")
        .unwrap()
        .statistics
        .last_event_time
        .is_some());

    manager.start_source("users").await.unwrap();
    let status = manager.get_source_status("users").unwrap();
    assert!(status.statistics.last_event_time.is_none());
    assert!(status.statistics.start_time.is_some());
    assert_eq!(manager.health_check().status, HealthStatus::Healthy);

    manager.stop_source("users").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_start_all_and_stop_all() {
    let connector = Arc::new(MemoryConnector::new());
    let (manager, _recorder) = setup(connector);
    manager.add_source(source("a")).unwrap();
    manager.add_source(source("b")).unwrap();
    manager
        .add_source(SourceConfig::new("c", "C", "unregistered"))
        .unwrap();

    let failures = manager.start_all().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "c");

    let stats = manager.get_statistics();
    assert_eq!(stats.total_sources, 3);
    assert_eq!(stats.active_sources, 2);

    assert!(manager.stop_all().await.is_empty());
    assert!(manager
        .get_all_statuses()
        .iter()
        .all(|s| s.status == SourceStatus::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_remove_running_source() {
    let connector = Arc::new(MemoryConnector::new().with_events(vec![row(1)]));
    let (manager, recorder) = setup(connector);
    manager.add_source(source("users")).unwrap();
    manager.start_source("users").await.unwrap();
    wait_until("delivery", || recorder.count() == 1).await;

    manager.remove_source("users").await.unwrap();
    assert!(manager.get_all_statuses().is_empty());
    // The stored position outlives the registration.
    assert!(manager.position_store().load("users").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_manager_from_yaml() {
    init_tracing();
    let yaml = r#"
sources:
  - id: orders
    name: Orders
    source_type: memory
    batch_size: 2
    poll_interval_ms: 100
    initial_position: earliest
filters:
  - id: only-orders
    kind: table
    condition:
      tables: ["orders"]
"#;
    let config = EngineConfig::from_yaml_str(yaml).unwrap();
    let connector = Arc::new(MemoryConnector::new().with_events(vec![
        ChangeEvent::insert("", "orders", json!({"id": 1})),
        ChangeEvent::insert("", "customers", json!({"id": 1})),
        ChangeEvent::insert("", "orders", json!({"id": 2})),
    ]));
    let mut connectors = rivven_capture::ConnectorRegistry::new();
    connectors.register("memory", connector);

    let manager =
        CaptureManager::from_config(config, connectors, Arc::new(MemoryPositionStore::new()))
            .unwrap();
    let recorder = Recorder::default();
    manager.add_processor(recorder.processor("recorder")).unwrap();

    manager.start_source("orders").await.unwrap();
    wait_until("orders delivered", || recorder.count() == 2).await;
    assert_eq!(recorder.markers(), vec!["1", "3"]);

    let stats = manager.get_statistics();
    assert_eq!(stats.totals.events_filtered, 1);
    assert_eq!(stats.filters, 1);
    assert_eq!(stats.processors["recorder"].batches_ok, 1);

    manager.stop_all().await;
}
