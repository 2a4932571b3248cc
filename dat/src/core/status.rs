//! Stage type, stage status and table status enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The pipeline stages, in default dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    /// Enumerate candidate files.
    Discovery,
    /// User-chosen subset of discovered files.
    Selection,
    /// Resolve per-file context values (optional).
    Context,
    /// Probe selected files for available tables.
    TableAvailability,
    /// User-chosen subset of available tables.
    TableSelection,
    /// Sample extraction for inspection (optional).
    Preview,
    /// Profile-driven extraction.
    Parse,
    /// Materialize the final artifact bundle.
    Export,
}

impl StageType {
    /// All stage types in default order.
    pub const ALL: [Self; 8] = [
        Self::Discovery,
        Self::Selection,
        Self::Context,
        Self::TableAvailability,
        Self::TableSelection,
        Self::Preview,
        Self::Parse,
        Self::Export,
    ];

    /// Returns the snake_case name used in ids, paths and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Selection => "selection",
            Self::Context => "context",
            Self::TableAvailability => "table_availability",
            Self::TableSelection => "table_selection",
            Self::Preview => "preview",
            Self::Parse => "parse",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown stage type '{s}'"))
    }
}

/// The lifecycle status of a stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    /// Open for (re)configuration; any prior artifact is preserved.
    #[default]
    Unlocked,
    /// Inputs frozen and artifact persisted.
    Locked,
    /// Finished; skipped optional stages land here with no artifact.
    Completed,
}

impl StageStatus {
    /// Returns true if the stage holds a stage id.
    #[must_use]
    pub fn is_locked_or_completed(&self) -> bool {
        matches!(self, Self::Locked | Self::Completed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked => write!(f, "UNLOCKED"),
            Self::Locked => write!(f, "LOCKED"),
            Self::Completed => write!(f, "COMPLETED"),
        }
    }
}

/// Canonical probe status of a table.
///
/// Older layers used a 4-value and a 6-value model; both map onto this one
/// through [`TableStatus::from_legacy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableStatus {
    /// Readable with at least one row.
    Available,
    /// Some but not all declared tables/sheets are readable.
    Partial,
    /// The file does not exist.
    Missing,
    /// Readable but zero rows.
    Empty,
    /// Read failure (including probe timeouts).
    Error,
}

impl TableStatus {
    /// Maps a legacy status string onto the canonical enum.
    ///
    /// `pending` has no canonical equivalent (an unprobed table is not
    /// reported) and yields `None`; `timeout` maps to [`TableStatus::Error`].
    #[must_use]
    pub fn from_legacy(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "available" | "ok" | "ready" => Some(Self::Available),
            "partial" => Some(Self::Partial),
            "missing" | "not_found" => Some(Self::Missing),
            "empty" => Some(Self::Empty),
            "error" | "failed" | "timeout" => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns true if the table can be extracted.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Available | Self::Partial)
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "AVAILABLE"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Missing => write!(f, "MISSING"),
            Self::Empty => write!(f, "EMPTY"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_type_round_trip_names() {
        for stage in StageType::ALL {
            assert_eq!(stage.as_str().parse::<StageType>().unwrap(), stage);
        }
        assert!("bogus".parse::<StageType>().is_err());
    }

    #[test]
    fn test_stage_type_serialize() {
        let json = serde_json::to_string(&StageType::TableAvailability).unwrap();
        assert_eq!(json, r#""table_availability""#);
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Completed).unwrap();
        assert_eq!(json, r#""COMPLETED""#);
        assert_eq!(StageStatus::default(), StageStatus::Unlocked);
        assert!(StageStatus::Locked.is_locked_or_completed());
        assert!(!StageStatus::Unlocked.is_locked_or_completed());
    }

    #[test]
    fn test_table_status_legacy_mapping() {
        assert_eq!(TableStatus::from_legacy("available"), Some(TableStatus::Available));
        assert_eq!(TableStatus::from_legacy("TIMEOUT"), Some(TableStatus::Error));
        assert_eq!(TableStatus::from_legacy("not_found"), Some(TableStatus::Missing));
        assert_eq!(TableStatus::from_legacy("pending"), None);
        assert!(TableStatus::Partial.is_usable());
        assert!(!TableStatus::Empty.is_usable());
    }
}
