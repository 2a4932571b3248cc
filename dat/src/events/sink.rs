//! Event types, the sink trait and its implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, Level};

use crate::core::StageType;
use crate::utils::manifest_timestamp;

/// Kinds of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A stage was locked and its artifact persisted.
    #[serde(rename = "stage.locked")]
    StageLocked,
    /// A lock reused an existing artifact.
    #[serde(rename = "stage.reused")]
    StageReused,
    /// A stage was unlocked on request.
    #[serde(rename = "stage.unlocked")]
    StageUnlocked,
    /// A stage was unlocked by another stage's cascade.
    #[serde(rename = "stage.cascade_unlocked")]
    StageCascadeUnlocked,
    /// An optional stage was skipped.
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    /// A locked stage was marked completed.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A checkpoint was recorded.
    #[serde(rename = "checkpoint.marked")]
    CheckpointMarked,
    /// A stage operation stopped on cancellation.
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    /// The run was archived.
    #[serde(rename = "run.archived")]
    RunArchived,
}

impl EventKind {
    /// Returns the dotted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageLocked => "stage.locked",
            Self::StageReused => "stage.reused",
            Self::StageUnlocked => "stage.unlocked",
            Self::StageCascadeUnlocked => "stage.cascade_unlocked",
            Self::StageSkipped => "stage.skipped",
            Self::StageCompleted => "stage.completed",
            Self::CheckpointMarked => "checkpoint.marked",
            Self::RunCancelled => "run.cancelled",
            Self::RunArchived => "run.archived",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Run the event belongs to.
    pub run_id: String,
    /// Stage concerned, if any.
    pub stage: Option<StageType>,
    /// Event-specific payload.
    pub data: Value,
    /// Emission time.
    pub timestamp: String,
}

impl DatEvent {
    /// Creates an event with an empty payload.
    #[must_use]
    pub fn new(kind: EventKind, run_id: impl Into<String>, stage: Option<StageType>) -> Self {
        Self {
            kind,
            run_id: run_id.into(),
            stage,
            data: Value::Null,
            timestamp: manifest_timestamp(),
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Receiver of lifecycle events.
///
/// Sinks must not fail; errors are theirs to log and suppress.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    async fn emit(&self, event: &DatEvent);
}

/// A sink that discards all events. Used when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &DatEvent) {}
}

/// A sink that logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at `level` (DEBUG logs at debug, anything else at info).
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &DatEvent) {
        let stage = event.stage.map(|s| s.as_str());
        if self.level == Level::DEBUG {
            debug!(event_type = %event.kind, run_id = %event.run_id, stage, data = %event.data, "Event");
        } else {
            info!(event_type = %event.kind, run_id = %event.run_id, stage, data = %event.data, "Event");
        }
    }
}

/// A sink that keeps every event, for tests and in-process inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<DatEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<DatEvent> {
        self.events.read().clone()
    }

    /// Returns the collected events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<DatEvent> {
        self.events.read().iter().filter(|e| e.kind == kind).cloned().collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &DatEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_noop_and_logging_sinks() {
        let event = DatEvent::new(EventKind::StageLocked, "run-1", Some(StageType::Discovery));
        tokio_test::block_on(async {
            NoOpEventSink.emit(&event).await;
            LoggingEventSink::default().emit(&event).await;
            LoggingEventSink::new(Level::DEBUG).emit(&event).await;
        });
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&DatEvent::new(EventKind::StageLocked, "r", Some(StageType::Parse))).await;
        sink.emit(&DatEvent::new(EventKind::CheckpointMarked, "r", None).with_data(json!({"sequence": 1})))
            .await;
        sink.emit(&DatEvent::new(EventKind::StageLocked, "r", Some(StageType::Export))).await;

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.of_kind(EventKind::StageLocked).len(), 2);
        assert_eq!(sink.events()[1].data["sequence"], 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(serde_json::to_value(EventKind::StageCascadeUnlocked).unwrap(), json!("stage.cascade_unlocked"));
        assert_eq!(EventKind::RunArchived.to_string(), "run.archived");
    }
}
