//! Per-run checkpoint records.
//!
//! A checkpoint marks a point where committed work is safe to keep. Records
//! are append-only and totally ordered by their sequence number.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::manifest_timestamp;

/// Kind of checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointType {
    /// One table's results were committed.
    TableComplete,
    /// A stage's artifact was committed.
    StageComplete,
}

impl CheckpointType {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TableComplete => "TABLE_COMPLETE",
            Self::StageComplete => "STAGE_COMPLETE",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Position within the run, starting at 1.
    pub sequence: u64,
    /// Checkpoint kind.
    pub checkpoint_type: CheckpointType,
    /// Artifact the checkpoint commits (stage id, or `<stage_id>/<table_id>`).
    pub artifact_id: String,
    /// When the checkpoint was recorded.
    pub timestamp: String,
}

/// The append-only checkpoint log of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRegistry {
    records: Vec<Checkpoint>,
}

impl CheckpointRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a checkpoint and returns it.
    pub fn mark_checkpoint(&mut self, checkpoint_type: CheckpointType, artifact_id: impl Into<String>) -> Checkpoint {
        let checkpoint = Checkpoint {
            sequence: self.records.len() as u64 + 1,
            checkpoint_type,
            artifact_id: artifact_id.into(),
            timestamp: manifest_timestamp(),
        };
        self.records.push(checkpoint.clone());
        checkpoint
    }

    /// Returns the most recent checkpoint.
    #[must_use]
    pub fn get_last_safe_point(&self) -> Option<&Checkpoint> {
        self.records.last()
    }

    /// Returns every checkpoint, oldest first.
    #[must_use]
    pub fn records(&self) -> &[Checkpoint] {
        &self.records
    }

    /// Returns the checkpoints of one kind whose artifact id starts with `prefix`.
    pub fn matching<'a>(
        &'a self,
        checkpoint_type: CheckpointType,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a Checkpoint> + 'a {
        self.records
            .iter()
            .filter(move |c| c.checkpoint_type == checkpoint_type && c.artifact_id.starts_with(prefix))
    }

    /// Returns the number of checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no checkpoint was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_are_ordered() {
        let mut registry = CheckpointRegistry::new();
        assert!(registry.get_last_safe_point().is_none());

        registry.mark_checkpoint(CheckpointType::TableComplete, "p1/sites");
        registry.mark_checkpoint(CheckpointType::TableComplete, "p1/meta");
        let last = registry.mark_checkpoint(CheckpointType::StageComplete, "p1");

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get_last_safe_point(), Some(&last));
        assert_eq!(last.sequence, 3);
        assert_eq!(registry.matching(CheckpointType::TableComplete, "p1/").count(), 2);
        assert_eq!(last.timestamp.len(), "2024-01-01T00:00:00Z".len());
    }

    #[test]
    fn test_serialized_type_names() {
        let json = serde_json::to_value(CheckpointType::TableComplete).unwrap();
        assert_eq!(json, serde_json::json!("TABLE_COMPLETE"));
        assert_eq!(CheckpointType::StageComplete.to_string(), "STAGE_COMPLETE");
    }
}
