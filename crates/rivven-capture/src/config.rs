//! Configuration types for rivven-capture
//!
//! - [`SourceConfig`] describes one change source: identity, opaque
//!   connection parameters, scope, performance and fault-tolerance knobs.
//! - [`EngineConfig`] is the YAML document that bootstraps a whole
//!   [`CaptureManager`](crate::CaptureManager): sources, shared filters,
//!   health thresholds and the position store.
//!
//! ```yaml
//! sources:
//!   - id: orders-db
//!     name: Orders
//!     source_type: memory
//!     batch_size: 500
//!     poll_interval_ms: 250
//!     error_tolerance: all
//!     initial_position: earliest
//! filters:
//!   - id: skip-audit
//!     kind: table
//!     condition: { tables: ["audit_*"] }
//!     include: false
//!     priority: 10
//! position_store:
//!   type: file
//!   dir: ${CAPTURE_STATE_DIR:-/var/lib/rivven/positions}
//! ```

use crate::dedup::EvictionPolicy;
use crate::error::{CaptureError, Result};
use crate::filter::Filter;
use crate::health::HealthThresholds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// How the monitor reacts to capture failures that survive all retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTolerance {
    /// Any unhandled failure moves the source to ERROR
    #[default]
    None,
    /// Log, wait the retry delay, keep going
    All,
    /// Same as `All` for capture failures
    Data,
}

impl ErrorTolerance {
    /// Whether a failed capture cycle keeps the source running.
    pub fn continues_on_error(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Where capture begins when no stored position exists.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosition {
    /// Replay everything the source still retains
    Earliest,
    /// Only changes made after start
    #[default]
    Latest,
    /// Changes at or after the given instant
    Timestamp(DateTime<Utc>),
}

/// What the monitor does when a source queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Drop the incoming event and keep capturing
    #[default]
    DropNewest,
    /// Wait until the processing loop frees space
    Block,
}

/// Configuration of a single change source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SourceConfig {
    /// Unique source id (immutable)
    #[validate(length(min = 1, max = 255))]
    pub id: String,

    /// Human-readable name (immutable)
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    /// Connector type used to capture this source (immutable)
    #[validate(length(min = 1, max = 64))]
    pub source_type: String,

    /// Opaque connection parameters, interpreted by the connector
    #[serde(default)]
    pub connection: HashMap<String, serde_json::Value>,

    /// Tables in scope
    #[serde(default)]
    pub tables: Vec<String>,

    /// Databases in scope
    #[serde(default)]
    pub databases: Vec<String>,

    /// Additional scope patterns
    #[serde(default)]
    pub patterns: Vec<String>,

    /// Events per batch
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub batch_size: usize,

    /// Capture cadence and batch timeout in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,

    /// Queue capacity between capture and processing
    #[serde(default = "default_max_queue_size")]
    #[validate(range(min = 1))]
    pub max_queue_size: usize,

    /// Number of content hashes remembered for deduplication
    #[serde(default = "default_dedup_capacity")]
    #[validate(range(min = 1))]
    pub dedup_capacity: usize,

    /// Eviction policy once the dedup set is full
    #[serde(default)]
    pub dedup_eviction: EvictionPolicy,

    /// Capture attempts per cycle before the cycle counts as failed
    #[serde(default = "default_retry_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub retry_attempts: u32,

    /// Delay between capture attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Reaction to unhandled capture failures
    #[serde(default)]
    pub error_tolerance: ErrorTolerance,

    /// Reaction to a full queue
    #[serde(default)]
    pub backpressure: BackpressureStrategy,

    /// Starting point when no position is stored
    #[serde(default)]
    pub initial_position: InitialPosition,

    /// Minimum time between position checkpoints in milliseconds
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_checkpoint_interval_ms() -> u64 {
    10_000
}

impl SourceConfig {
    /// Create a config with default knobs.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            source_type: source_type.into(),
            connection: HashMap::new(),
            tables: Vec::new(),
            databases: Vec::new(),
            patterns: Vec::new(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            max_queue_size: default_max_queue_size(),
            dedup_capacity: default_dedup_capacity(),
            dedup_eviction: EvictionPolicy::default(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            error_tolerance: ErrorTolerance::default(),
            backpressure: BackpressureStrategy::default(),
            initial_position: InitialPosition::default(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn with_dedup(mut self, capacity: usize, eviction: EvictionPolicy) -> Self {
        self.dedup_capacity = capacity;
        self.dedup_eviction = eviction;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_error_tolerance(mut self, tolerance: ErrorTolerance) -> Self {
        self.error_tolerance = tolerance;
        self
    }

    pub fn with_backpressure(mut self, strategy: BackpressureStrategy) -> Self {
        self.backpressure = strategy;
        self
    }

    pub fn with_initial_position(mut self, initial: InitialPosition) -> Self {
        self.initial_position = initial;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_tables(mut self, tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_connection(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.connection.insert(key.into(), value);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    /// Validate field ranges.
    pub fn check(&self) -> Result<()> {
        Validate::validate(self)
            .map_err(|e| CaptureError::config(format!("source '{}': {}", self.id, e)))
    }

    /// Apply an update to the mutable fields and bump `updated_at`.
    ///
    /// The update is validated as a whole; on error `self` is unchanged.
    pub fn apply(&mut self, update: SourceConfigUpdate) -> Result<()> {
        let mut next = self.clone();
        update.apply_to(&mut next);
        next.check()?;
        next.updated_at = Utc::now();
        *self = next;
        Ok(())
    }
}

/// Replacement values for the mutable fields of a [`SourceConfig`].
///
/// Identity (`id`, `name`, `source_type`) cannot be changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfigUpdate {
    pub connection: Option<HashMap<String, serde_json::Value>>,
    pub tables: Option<Vec<String>>,
    pub databases: Option<Vec<String>>,
    pub patterns: Option<Vec<String>>,
    pub batch_size: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub max_queue_size: Option<usize>,
    pub dedup_capacity: Option<usize>,
    pub dedup_eviction: Option<EvictionPolicy>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub error_tolerance: Option<ErrorTolerance>,
    pub backpressure: Option<BackpressureStrategy>,
    pub initial_position: Option<InitialPosition>,
    pub checkpoint_interval_ms: Option<u64>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl SourceConfigUpdate {
    fn apply_to(self, config: &mut SourceConfig) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { config.$field = v; })*
            };
        }
        set!(
            connection,
            tables,
            databases,
            patterns,
            batch_size,
            poll_interval_ms,
            max_queue_size,
            dedup_capacity,
            dedup_eviction,
            retry_attempts,
            retry_delay_ms,
            error_tolerance,
            backpressure,
            initial_position,
            checkpoint_interval_ms,
            tags,
            metadata,
        );
    }
}

/// Position store backend selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PositionStoreConfig {
    /// Keep positions in memory (lost on restart)
    #[default]
    Memory,
    /// One JSON file per source under `dir`
    File {
        dir: PathBuf,
        #[serde(default = "default_true")]
        fsync: bool,
    },
}

fn default_true() -> bool {
    true
}

/// Root configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Filters shared by every source
    #[serde(default)]
    pub filters: Vec<Filter>,

    #[serde(default)]
    pub health: HealthThresholds,

    #[serde(default)]
    pub position_store: PositionStoreConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CaptureError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text, expanding environment variables.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(yaml);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            source.check()?;
            if !seen.insert(source.id.as_str()) {
                return Err(CaptureError::DuplicateSource(source.id.clone()));
            }
        }

        let mut seen = HashSet::new();
        for filter in &self.filters {
            if !seen.insert(filter.id.as_str()) {
                return Err(CaptureError::DuplicateFilter(filter.id.clone()));
            }
            filter.validate()?;
        }

        self.health.validate()?;
        Ok(())
    }
}
