//! # rivven-capture - Multi-source change capture engine
//!
//! Attaches to any number of change sources, normalizes their mutations into
//! [`ChangeEvent`]s, deduplicates and filters them, and hands batches to
//! registered processors while keeping a resumable position per source.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐        ┌──────────────┐
//!  │ Connector A  │  ...   │ Connector N  │    CaptureConnector trait
//!  └──────┬───────┘        └──────┬───────┘
//!         ▼                       ▼
//!  ┌──────────────┐        ┌──────────────┐
//!  │ Monitor loop │        │ Monitor loop │    dedup → FilterChain
//!  └──────┬───────┘        └──────┬───────┘
//!         ▼ bounded queue         ▼
//!  ┌──────────────┐        ┌──────────────┐
//!  │ Processing   │        │ Processing   │    Batcher (size / time)
//!  └──────┬───────┘        └──────┬───────┘
//!         ▼                       ▼
//!  ┌──────────────────────────────────────┐
//!  │  ProcessorRegistry (shared, ordered) │
//!  └──────────────────────────────────────┘
//! ```
//!
//! Positions are checkpointed to a [`PositionStore`]; delivery is
//! at-least-once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> rivven_capture::Result<()> {
//! use rivven_capture::testing::MemoryConnector;
//! use rivven_capture::{CaptureManager, MemoryPositionStore, Processor, SourceConfig};
//! use std::sync::Arc;
//!
//! let manager = CaptureManager::new(Arc::new(MemoryPositionStore::new()));
//! manager.register_connector("memory", Arc::new(MemoryConnector::new()));
//! manager.add_source(SourceConfig::new("orders", "Orders", "memory"))?;
//! manager.add_processor(Processor::from_fn("print", |batch| {
//!     println!("batch {} with {} events", batch.sequence, batch.len());
//!     Ok(())
//! }))?;
//!
//! manager.start_source("orders").await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod connector;
pub mod dedup;
pub mod error;
pub mod event;
pub mod filter;
pub mod health;
pub mod manager;
mod metrics;
mod monitor;
pub mod position;
mod processing;
pub mod processor;
pub mod queue;
pub mod source;
pub mod testing;

pub use batch::{BatchCounts, Batcher, EventBatch};
pub use config::{
    BackpressureStrategy, EngineConfig, ErrorTolerance, InitialPosition, PositionStoreConfig,
    SourceConfig, SourceConfigUpdate,
};
pub use connector::{CaptureConnector, ConnectorRegistry};
pub use dedup::{DedupSet, EvictionPolicy};
pub use error::{CaptureError, ErrorCategory, Result};
pub use event::{ChangeEvent, EventKind};
pub use filter::{
    CompareOp, CustomPredicate, FieldCondition, Filter, FilterChain, FilterCondition,
    FilterDecision, FilterKind,
};
pub use health::{HealthMonitor, HealthSnapshot, HealthStatus, HealthThresholds, SourceHealth};
pub use manager::{CaptureManager, EngineStatistics};
pub use position::{
    open_store, FilePositionStore, MemoryPositionStore, Position, PositionStore,
    SharedPositionStore,
};
pub use processor::{
    BatchHandler, BatchHints, DispatchReport, Processor, ProcessorRegistry, ProcessorStatsSnapshot,
};
pub use queue::EventQueue;
pub use source::{SourceStatus, SourceStatusSnapshot, StatisticsSnapshot};
