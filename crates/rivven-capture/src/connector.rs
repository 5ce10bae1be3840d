//! Capture connector abstraction
//!
//! Database-agnostic seam between the engine and a concrete change source.
//! The engine only calls [`CaptureConnector::capture`] with the source config
//! and the current position; everything source-specific (log readers,
//! polling queries, replication slots) lives behind it.

use crate::config::SourceConfig;
use crate::error::Result;
use crate::event::ChangeEvent;
use crate::position::Position;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Source-type-specific change reader.
///
/// Implementations must tolerate being called again with an unchanged
/// position (replay); events carry their own position markers.
#[async_trait]
pub trait CaptureConnector: Send + Sync {
    /// Read changes after `position`.
    async fn capture(&self, config: &SourceConfig, position: &Position)
        -> Result<Vec<ChangeEvent>>;

    /// Validate connector-specific parts of the config (connection params,
    /// scope). Called when a source is registered.
    fn validate_config(&self, _config: &SourceConfig) -> Result<()> {
        Ok(())
    }
}

/// Registry mapping source types to connectors.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn CaptureConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector, replacing any previous one for the type.
    pub fn register(&mut self, source_type: &str, connector: Arc<dyn CaptureConnector>) {
        self.connectors.insert(source_type.to_string(), connector);
    }

    pub fn get(&self, source_type: &str) -> Option<&Arc<dyn CaptureConnector>> {
        self.connectors.get(source_type)
    }

    pub fn contains(&self, source_type: &str) -> bool {
        self.connectors.contains_key(source_type)
    }

    /// Registered source types, sorted.
    pub fn source_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("source_types", &self.source_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;

    struct Rejecting;

    #[async_trait]
    impl CaptureConnector for Rejecting {
        async fn capture(&self, _: &SourceConfig, _: &Position) -> Result<Vec<ChangeEvent>> {
            Ok(Vec::new())
        }

        fn validate_config(&self, config: &SourceConfig) -> Result<()> {
            if config.connection.contains_key("dsn") {
                Ok(())
            } else {
                Err(CaptureError::config("missing dsn"))
            }
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = ConnectorRegistry::new();
        assert!(registry.is_empty());

        registry.register("pg", Arc::new(Rejecting));
        registry.register("mysql", Arc::new(Rejecting));

        assert!(registry.contains("pg"));
        assert!(!registry.contains("oracle"));
        assert_eq!(registry.source_types(), vec!["mysql", "pg"]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_validate_config_hook() {
        let connector = Rejecting;
        let config = SourceConfig::new("s1", "S1", "pg");
        assert!(connector.validate_config(&config).is_err());

        let config = config.with_connection("dsn", serde_json::json!("postgres://localhost"));
        assert!(connector.validate_config(&config).is_ok());
        assert!(connector
            .capture(&config, &Position::new("s1", "earliest"))
            .await
            .unwrap()
            .is_empty());
    }
}
