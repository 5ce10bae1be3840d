//! # Source positions
//!
//! Resumable position tracking for change sources.
//!
//! ## Features
//!
//! - **Opaque payloads**: the engine never interprets a position; connectors do
//! - **Initial policies**: `earliest`, `latest`, `timestamp:<rfc3339>`
//! - **Pluggable storage**: [`PositionStore`] with in-memory and file backends
//! - **Atomic file updates**: temp file, optional fsync, rename
//!
//! ```ignore
//! let store = FilePositionStore::new("/var/lib/rivven/positions").await?;
//! store.save(&Position::new("orders-db", "0/16B3748")).await?;
//!
//! if let Some(pos) = store.load("orders-db").await? {
//!     // resume from pos.payload
//! }
//! ```

use crate::config::{InitialPosition, PositionStoreConfig};
use crate::error::{CaptureError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const EARLIEST: &str = "earliest";
const LATEST: &str = "latest";
const TIMESTAMP_PREFIX: &str = "timestamp:";

/// Resumable position of a single source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Source the position belongs to
    pub source_id: String,
    /// Opaque, connector-defined marker
    pub payload: String,
    /// When the position was last changed
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(source_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            payload: payload.into(),
            updated_at: Utc::now(),
        }
    }

    /// Position derived from an initial-position policy.
    pub fn initial(source_id: impl Into<String>, policy: &InitialPosition) -> Self {
        let payload = match policy {
            InitialPosition::Earliest => EARLIEST.to_string(),
            InitialPosition::Latest => LATEST.to_string(),
            InitialPosition::Timestamp(ts) => format!("{}{}", TIMESTAMP_PREFIX, ts.to_rfc3339()),
        };
        Self::new(source_id, payload)
    }

    /// Whether the payload is an initial-policy sentinel rather than a marker.
    pub fn is_initial(&self) -> bool {
        self.payload == EARLIEST
            || self.payload == LATEST
            || self.payload.starts_with(TIMESTAMP_PREFIX)
    }

    /// Timestamp of a `timestamp:<rfc3339>` sentinel.
    pub fn initial_timestamp(&self) -> Option<DateTime<Utc>> {
        self.payload
            .strip_prefix(TIMESTAMP_PREFIX)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Replace the payload, touching `updated_at`.
    pub fn advance(&mut self, payload: impl Into<String>) {
        self.payload = payload.into();
        self.updated_at = Utc::now();
    }

    pub fn to_storage_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Age of the position in seconds.
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.updated_at).num_seconds().max(0)
    }
}

impl FromStr for Position {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Storage backend for source positions.
#[async_trait::async_trait]
pub trait PositionStore: Send + Sync {
    async fn load(&self, source_id: &str) -> Result<Option<Position>>;
    async fn save(&self, position: &Position) -> Result<()>;
    async fn delete(&self, source_id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;
}

/// Shared position store.
pub type SharedPositionStore = Arc<dyn PositionStore>;

/// Build the store selected by configuration.
pub async fn open_store(config: &PositionStoreConfig) -> Result<SharedPositionStore> {
    match config {
        PositionStoreConfig::Memory => Ok(Arc::new(MemoryPositionStore::new())),
        PositionStoreConfig::File { dir, fsync } => {
            Ok(Arc::new(FilePositionStore::with_options(dir, *fsync).await?))
        }
    }
}

/// In-memory position store (for testing or when persistence isn't needed).
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: RwLock<HashMap<String, Position>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self, source_id: &str) -> Result<Option<Position>> {
        Ok(self.positions.read().await.get(source_id).cloned())
    }

    async fn save(&self, position: &Position) -> Result<()> {
        self.positions
            .write()
            .await
            .insert(position.source_id.clone(), position.clone());
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<()> {
        self.positions.write().await.remove(source_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.positions.read().await.keys().cloned().collect())
    }
}

/// Persistent position store.
///
/// One JSON document per source, written atomically.
pub struct FilePositionStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, Position>>,
    fsync: bool,
}

impl FilePositionStore {
    /// Create a store under `base_dir`, loading existing positions.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Create a store with explicit fsync behaviour.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        };
        store.load_all().await?;
        Ok(store)
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key == "." || key == ".."
        {
            return Err(CaptureError::position_store(format!(
                "invalid position key '{}'",
                key
            )));
        }
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", key))
    }

    async fn read_file(&self, key: &str) -> Result<Option<Position>> {
        let file_path = self.file_path(key);
        if !fs::try_exists(&file_path).await? {
            return Ok(None);
        }

        let mut file = File::open(&file_path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        Ok(Some(contents.parse()?))
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await?;

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_file(stem).await {
                Ok(Some(position)) => {
                    self.cache.write().await.insert(stem.to_string(), position);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(key = stem, error = %e, "Failed to load position"),
            }
        }

        if loaded > 0 {
            info!("Loaded {} positions from {}", loaded, self.base_dir.display());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PositionStore for FilePositionStore {
    async fn load(&self, source_id: &str) -> Result<Option<Position>> {
        if let Some(pos) = self.cache.read().await.get(source_id) {
            return Ok(Some(pos.clone()));
        }

        Self::validate_key(source_id)?;
        let position = self.read_file(source_id).await?;
        if let Some(pos) = &position {
            self.cache
                .write()
                .await
                .insert(source_id.to_string(), pos.clone());
        }
        Ok(position)
    }

    async fn save(&self, position: &Position) -> Result<()> {
        let key = position.source_id.as_str();
        Self::validate_key(key)?;

        let file_path = self.file_path(key);
        let temp_path = file_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(position)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &file_path).await?;

        self.cache
            .write()
            .await
            .insert(key.to_string(), position.clone());

        debug!("Saved position for {}: {}", key, position.payload);
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<()> {
        Self::validate_key(source_id)?;
        let file_path = self.file_path(source_id);
        if fs::try_exists(&file_path).await? {
            fs::remove_file(&file_path).await?;
        }
        self.cache.write().await.remove(source_id);

        info!("Deleted position for {}", source_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.cache.read().await.keys().cloned().collect())
    }
}
