//! Testing utilities
//!
//! [`MemoryConnector`] is a scripted, replayable connector for tests and
//! demos. It needs no external system.
//!
//! # Example
//!
//! ```rust,ignore
//! let connector = MemoryConnector::new()
//!     .with_events(vec![
//!         ChangeEvent::insert("", "users", json!({"id": 1})),
//!         ChangeEvent::insert("", "users", json!({"id": 2})),
//!     ]);
//! connector.fail_next(2, "connection reset");
//!
//! manager.register_connector("memory", Arc::new(connector));
//! ```
//!
//! Markers are consecutive integers starting at 1. Positions are interpreted
//! as follows:
//!
//! - `earliest`: everything
//! - `latest`: nothing old; a heartbeat carrying the current marker is
//!   emitted so the position moves off the sentinel
//! - `timestamp:<rfc3339>`: events at or after the instant
//! - `<n>`: events with a marker strictly greater than `n`

use crate::config::SourceConfig;
use crate::connector::CaptureConnector;
use crate::error::{CaptureError, Result};
use crate::event::{ChangeEvent, EventKind};
use crate::position::Position;
use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Script {
    events: Vec<(u64, ChangeEvent)>,
    last_marker: u64,
    failures_left: u32,
    fail_message: String,
    calls: u64,
}

/// In-memory connector replaying a scripted change log.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    script: Mutex<Script>,
    max_per_capture: Option<usize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events to the log.
    pub fn with_events(self, events: Vec<ChangeEvent>) -> Self {
        for event in events {
            self.push(event);
        }
        self
    }

    /// Return at most `n` events per capture call.
    pub fn with_max_per_capture(mut self, n: usize) -> Self {
        self.max_per_capture = Some(n.max(1));
        self
    }

    /// Append one event, returning its marker.
    pub fn push(&self, mut event: ChangeEvent) -> u64 {
        let mut script = self.script.lock();
        script.last_marker += 1;
        let marker = script.last_marker;
        event.position = Some(marker.to_string());
        script.events.push((marker, event));
        marker
    }

    /// Make the next `n` capture calls fail with `message`.
    pub fn fail_next(&self, n: u32, message: impl Into<String>) {
        let mut script = self.script.lock();
        script.failures_left = n;
        script.fail_message = message.into();
    }

    /// Number of capture calls so far.
    pub fn capture_calls(&self) -> u64 {
        self.script.lock().calls
    }

    /// Highest marker in the log.
    pub fn last_marker(&self) -> u64 {
        self.script.lock().last_marker
    }
}

#[async_trait]
impl CaptureConnector for MemoryConnector {
    async fn capture(
        &self,
        config: &SourceConfig,
        position: &Position,
    ) -> Result<Vec<ChangeEvent>> {
        let mut script = self.script.lock();
        script.calls += 1;

        if script.failures_left > 0 {
            script.failures_left -= 1;
            return Err(CaptureError::connector(&config.id, script.fail_message.clone()));
        }

        let selected: Vec<ChangeEvent> = match position.payload.as_str() {
            "earliest" => script.events.iter().map(|(_, e)| e.clone()).collect(),
            "latest" => {
                let heartbeat = ChangeEvent::new(&config.id, EventKind::Heartbeat)
                    .with_position(script.last_marker.to_string());
                return Ok(vec![heartbeat]);
            }
            payload => {
                if let Some(since) = position.initial_timestamp() {
                    script
                        .events
                        .iter()
                        .filter(|(_, e)| e.timestamp >= since)
                        .map(|(_, e)| e.clone())
                        .collect()
                } else {
                    let after: u64 = payload.parse().map_err(|_| {
                        CaptureError::connector(
                            &config.id,
                            format!("unrecognized position '{}'", payload),
                        )
                    })?;
                    script
                        .events
                        .iter()
                        .filter(|(marker, _)| *marker > after)
                        .map(|(_, e)| e.clone())
                        .collect()
                }
            }
        };

        Ok(match self.max_per_capture {
            Some(n) => selected.into_iter().take(n).collect(),
            None => selected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn config() -> SourceConfig {
        SourceConfig::new("s1", "S1", "memory")
    }

    fn connector() -> MemoryConnector {
        MemoryConnector::new().with_events(vec![
            ChangeEvent::insert("", "t", json!({"id": 1})),
            ChangeEvent::insert("", "t", json!({"id": 2})),
            ChangeEvent::insert("", "t", json!({"id": 3})),
        ])
    }

    #[tokio::test]
    async fn test_replays_after_marker() {
        let c = connector();
        let all = c
            .capture(&config(), &Position::new("s1", "earliest"))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].position.as_deref(), Some("3"));

        let rest = c.capture(&config(), &Position::new("s1", "1")).await.unwrap();
        let markers: Vec<_> = rest.iter().filter_map(|e| e.position.clone()).collect();
        assert_eq!(markers, vec!["2", "3"]);

        assert!(c
            .capture(&config(), &Position::new("s1", "3"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_latest_emits_heartbeat() {
        let c = connector();
        let events = c
            .capture(&config(), &Position::new("s1", "latest"))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Heartbeat);
        assert_eq!(events[0].position.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_timestamp_position() {
        let c = MemoryConnector::new();
        c.push(
            ChangeEvent::insert("", "t", json!({"id": 1}))
                .with_timestamp(Utc::now() - chrono::Duration::hours(2)),
        );
        c.push(ChangeEvent::insert("", "t", json!({"id": 2})));

        let since = Utc::now() - chrono::Duration::hours(1);
        let pos = Position::new("s1", format!("timestamp:{}", since.to_rfc3339()));
        let events = c.capture(&config(), &pos).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].position.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_fail_next_and_max_per_capture() {
        let c = connector().with_max_per_capture(2);
        c.fail_next(1, "boom");

        let err = c
            .capture(&config(), &Position::new("s1", "earliest"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        let events = c
            .capture(&config(), &Position::new("s1", "earliest"))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(c.capture_calls(), 2);

        assert!(c
            .capture(&config(), &Position::new("s1", "garbage"))
            .await
            .is_err());
    }
}
