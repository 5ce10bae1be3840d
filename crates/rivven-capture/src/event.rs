//! Change event representation
//!
//! Uniform event model every capture connector converts its raw mutation
//! notifications into.
//!
//! Two values are derived rather than stored:
//!
//! - [`ChangeEvent::identity_key`] names the row the event is about
//!   (`source:database:table[:pk]`).
//! - [`ChangeEvent::content_hash`] fingerprints the mutation itself
//!   (kind + before + after) and drives deduplication. Envelope fields such as
//!   the event id, timestamp and position marker are excluded so a replayed
//!   mutation hashes identically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Kind of change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Table truncated
    Truncate,
    /// DDL / schema change
    SchemaChange,
    /// Liveness marker without data
    Heartbeat,
}

impl EventKind {
    /// Check if this kind carries row data (INSERT/UPDATE/DELETE)
    pub fn is_dml(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Truncate => "truncate",
            Self::SchemaChange => "schema_change",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single captured change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique event id
    pub id: String,
    /// Id of the source that produced the event
    pub source_id: String,
    /// Change kind
    pub kind: EventKind,
    /// When the change happened at the source
    pub timestamp: DateTime<Utc>,
    /// Database name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Table name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Row image before the change (UPDATE/DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    /// Row image after the change (INSERT/UPDATE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    /// Source position marker of this change (opaque)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    /// Schema descriptor (opaque)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ChangeEvent {
    /// Create an event of the given kind with no images.
    pub fn new(source_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            kind,
            timestamp: Utc::now(),
            database: None,
            table: None,
            before: None,
            after: None,
            position: None,
            schema: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a new INSERT event
    pub fn insert(
        source_id: impl Into<String>,
        table: impl Into<String>,
        after: serde_json::Value,
    ) -> Self {
        let mut event = Self::new(source_id, EventKind::Insert).with_table(table);
        event.after = Some(after);
        event
    }

    /// Create a new UPDATE event
    pub fn update(
        source_id: impl Into<String>,
        table: impl Into<String>,
        before: Option<serde_json::Value>,
        after: serde_json::Value,
    ) -> Self {
        let mut event = Self::new(source_id, EventKind::Update).with_table(table);
        event.before = before;
        event.after = Some(after);
        event
    }

    /// Create a new DELETE event
    pub fn delete(
        source_id: impl Into<String>,
        table: impl Into<String>,
        before: serde_json::Value,
    ) -> Self {
        let mut event = Self::new(source_id, EventKind::Delete).with_table(table);
        event.before = Some(before);
        event
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Attach the source position marker of this change.
    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Primary id of the affected row, if the images carry an `id` field.
    pub fn primary_id(&self) -> Option<String> {
        self.after
            .as_ref()
            .and_then(|v| v.get("id"))
            .or_else(|| self.before.as_ref().and_then(|v| v.get("id")))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }

    /// Identity of the row this event is about.
    ///
    /// Format: `source:database:table` with `:pk` appended when a primary id
    /// is present.
    pub fn identity_key(&self) -> String {
        let mut key = format!(
            "{}:{}:{}",
            self.source_id,
            self.database.as_deref().unwrap_or_default(),
            self.table.as_deref().unwrap_or_default()
        );
        if let Some(pk) = self.primary_id() {
            key.push(':');
            key.push_str(&pk);
        }
        key
    }

    /// Hex SHA-256 over kind, before and after.
    ///
    /// `serde_json` maps are ordered by key, so the encoding is canonical.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0u8]);
        match &self.before {
            Some(v) => hasher.update(v.to_string().as_bytes()),
            None => hasher.update(b"null"),
        }
        hasher.update([0u8]);
        match &self.after {
            Some(v) => hasher.update(v.to_string().as_bytes()),
            None => hasher.update(b"null"),
        }
        format!("{:x}", hasher.finalize())
    }

    /// Row image used for column/field lookups: after, else before.
    pub fn row(&self) -> Option<&serde_json::Value> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_event() {
        let event = ChangeEvent::insert("pg-main", "users", json!({"id": 1, "name": "Alice"}))
            .with_database("app");

        assert_eq!(event.kind, EventKind::Insert);
        assert!(event.before.is_none());
        assert!(event.after.is_some());
        assert_eq!(event.identity_key(), "pg-main:app:users:1");
    }

    #[test]
    fn test_identity_key_without_pk() {
        let event = ChangeEvent::new("s1", EventKind::Truncate).with_table("orders");
        assert_eq!(event.identity_key(), "s1::orders");
    }

    #[test]
    fn test_identity_key_uses_before_image_for_delete() {
        let event = ChangeEvent::delete("s1", "users", json!({"id": "u-9"}));
        assert_eq!(event.identity_key(), "s1::users:u-9");
    }

    #[test]
    fn test_content_hash_ignores_envelope() {
        let a = ChangeEvent::insert("s1", "users", json!({"id": 1, "name": "Alice"}))
            .with_position("10");
        let b = ChangeEvent::insert("s1", "users", json!({"name": "Alice", "id": 1}))
            .with_position("11");

        assert_ne!(a.id, b.id);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_content_hash_distinguishes_kind_and_images() {
        let insert = ChangeEvent::insert("s1", "users", json!({"id": 1}));
        let update = ChangeEvent::update("s1", "users", None, json!({"id": 1}));
        let other = ChangeEvent::insert("s1", "users", json!({"id": 2}));

        assert_ne!(insert.content_hash(), update.content_hash());
        assert_ne!(insert.content_hash(), other.content_hash());
    }

    #[test]
    fn test_before_and_after_are_not_interchangeable() {
        let mut a = ChangeEvent::new("s1", EventKind::Update);
        a.before = Some(json!({"v": 1}));
        let mut b = ChangeEvent::new("s1", EventKind::Update);
        b.after = Some(json!({"v": 1}));

        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_event_serialization() {
        let event = ChangeEvent::insert("s1", "users", json!({"id": 1})).with_position("42");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"insert\""));
        assert!(!json.contains("before"));

        let parsed: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_is_dml() {
        assert!(EventKind::Insert.is_dml());
        assert!(EventKind::Delete.is_dml());
        assert!(!EventKind::Heartbeat.is_dml());
        assert!(!EventKind::SchemaChange.is_dml());
    }
}
