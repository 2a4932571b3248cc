//! Error types for the DAT pipeline.
//!
//! Every error carries the context needed to diagnose it without reading
//! logs: the stage type, table id, rule id or unmet dependency involved.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::StageType;
use crate::validation::Violation;

/// Result type alias for DAT operations.
pub type Result<T> = std::result::Result<T, DatError>;

/// The main error type for DAT operations.
#[derive(Debug, Error)]
pub enum DatError {
    /// A source file could not be read or is malformed.
    #[error("Input error for '{path}': {message}")]
    Input {
        /// Workspace-relative path of the offending file.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// A table's extracted columns do not match its stable column set.
    #[error("Schema mismatch for table '{table_id}': missing {missing:?}, unexpected {extra:?}")]
    SchemaMismatch {
        /// The table being extracted.
        table_id: String,
        /// Canonical columns absent from the extraction.
        missing: Vec<String>,
        /// Extracted columns absent from the canonical set.
        extra: Vec<String>,
    },

    /// One or more validation rules failed under a `stop` policy.
    #[error("Validation failed for table '{table_id}': {}", format_violations(violations))]
    Validation {
        /// The table being validated.
        table_id: String,
        /// Every violated rule.
        violations: Vec<Violation>,
    },

    /// The same stage id was computed from differing inputs.
    #[error("Determinism conflict for {stage} stage id '{stage_id}': stored input hash {existing_hash} differs from {new_hash}")]
    DeterminismConflict {
        /// The stage being locked.
        stage: StageType,
        /// The colliding stage id.
        stage_id: String,
        /// Input hash recorded with the existing artifact.
        existing_hash: String,
        /// Input hash of the current request.
        new_hash: String,
    },

    /// A lock/unlock/skip/complete request violated the stage graph.
    #[error("Gating error for {stage}: {reason}")]
    Gating {
        /// The stage the request targeted.
        stage: StageType,
        /// Why the request was rejected.
        reason: String,
        /// The first unmet dependency, when the rejection is dependency-related.
        unmet_dependency: Option<StageType>,
    },

    /// The operation was aborted by a cancellation token.
    #[error("Cancelled during {stage}: {reason}")]
    Cancellation {
        /// The stage that was running.
        stage: StageType,
        /// The cancellation reason.
        reason: String,
    },

    /// No adapter is registered for a file's extension.
    #[error("No adapter registered for '{path}' (extension '{extension}')")]
    AdapterNotFound {
        /// The file path.
        path: String,
        /// The unmatched extension.
        extension: String,
    },

    /// A profile document is structurally or semantically invalid.
    #[error("Invalid profile '{profile}': {}", errors.join("; "))]
    Profile {
        /// Profile name.
        profile: String,
        /// Every problem found.
        errors: Vec<String>,
    },

    /// A profile was not found in the store.
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Attempted to modify a read-only (system) profile.
    #[error("Profile '{profile}' is system-provided and cannot be {action}")]
    ProfilePermission {
        /// Profile name.
        profile: String,
        /// The rejected action.
        action: String,
    },

    /// A context override was supplied for a key outside the allow-list.
    #[error("Context override for key '{key}' is not allowed by profile '{profile}'")]
    OverrideRejected {
        /// The rejected key.
        key: String,
        /// The profile whose allow-list rejected it.
        profile: String,
    },

    /// A context value could not be resolved under an `error` policy.
    #[error("Context key '{key}' for '{file}': {message}")]
    Context {
        /// The context key.
        key: String,
        /// The file being resolved.
        file: String,
        /// What went wrong.
        message: String,
    },

    /// A path escaped the workspace or was otherwise unsafe.
    #[error("Unsafe path '{path}': {reason}")]
    PathSafety {
        /// The offending path.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// An expression failed to parse or evaluate.
    #[error("Expression error in '{expression}': {message}")]
    Expression {
        /// The expression source.
        expression: String,
        /// What went wrong.
        message: String,
    },

    /// A table's extraction strategy could not read its subtree.
    #[error("Extraction '{strategy}' failed: {message}")]
    Extraction {
        /// The strategy kind.
        strategy: String,
        /// What went wrong.
        message: String,
    },

    /// A transform step could not be applied.
    #[error("Transform '{step}' failed: {message}")]
    Transform {
        /// The step name.
        step: String,
        /// What went wrong.
        message: String,
    },

    /// An output could not be built.
    #[error("Output '{output}' failed: {message}")]
    Output {
        /// The output name.
        output: String,
        /// What went wrong.
        message: String,
    },

    /// A JSONPath failed to parse.
    #[error("Invalid JSONPath '{path}': {message}")]
    JsonPath {
        /// The path source.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// No run with this id exists.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error for '{path}': {source}")]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error from the CSV library.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Error from the Parquet library.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Error from the Arrow library.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Error from the Excel reader.
    #[error("Excel error: {0}")]
    Excel(#[from] calamine::Error),

    /// Regex compilation error.
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// Invalid file glob.
    #[error("Glob error: {0}")]
    Glob(#[from] glob::PatternError),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("[{}] {}", v.rule_id, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DatError {
    /// Creates an input error.
    #[must_use]
    pub fn input(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Input {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a gating error without a dependency.
    #[must_use]
    pub fn gating(stage: StageType, reason: impl Into<String>) -> Self {
        Self::Gating {
            stage,
            reason: reason.into(),
            unmet_dependency: None,
        }
    }

    /// Creates a gating error naming the unmet dependency.
    #[must_use]
    pub fn unmet_dependency(stage: StageType, dependency: StageType, required: &str) -> Self {
        Self::Gating {
            stage,
            reason: format!("requires {dependency} to be {required}"),
            unmet_dependency: Some(dependency),
        }
    }

    /// Creates an IO error for a path.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an expression error.
    #[must_use]
    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Returns a stable machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Input { .. } | Self::Io { .. } | Self::Csv(_)
            | Self::Parquet(_)
            | Self::Arrow(_)
            | Self::Excel(_) => {
                "DAT-INPUT"
            }
            Self::SchemaMismatch { .. } => "DAT-SCHEMA-MISMATCH",
            Self::Validation { .. } => "DAT-VALIDATION",
            Self::DeterminismConflict { .. } => "DAT-DETERMINISM-CONFLICT",
            Self::Gating { .. } => "DAT-GATING",
            Self::Cancellation { .. } => "DAT-CANCELLED",
            Self::AdapterNotFound { .. } => "DAT-ADAPTER-NOT-FOUND",
            Self::Profile { .. } => "DAT-PROFILE-INVALID",
            Self::ProfileNotFound(_) => "DAT-PROFILE-NOT-FOUND",
            Self::ProfilePermission { .. } => "DAT-PROFILE-PERMISSION",
            Self::OverrideRejected { .. } => "DAT-OVERRIDE-REJECTED",
            Self::Context { .. } => "DAT-CONTEXT",
            Self::PathSafety { .. } => "DAT-PATH-SAFETY",
            Self::Expression { .. } => "DAT-EXPRESSION",
            Self::Extraction { .. } => "DAT-EXTRACTION",
            Self::Transform { .. } => "DAT-TRANSFORM",
            Self::Output { .. } => "DAT-OUTPUT",
            Self::JsonPath { .. } => "DAT-JSONPATH",
            Self::RunNotFound(_) => "DAT-RUN-NOT-FOUND",
            Self::Config(_) => "DAT-CONFIG",
            Self::Json(_) => "DAT-JSON",
            Self::Regex(_) => "DAT-REGEX",
            Self::Glob(_) => "DAT-GLOB",
            Self::Internal(_) => "DAT-INTERNAL",
        }
    }

    /// Returns true if the error is orchestration-level (never corrupts state).
    #[must_use]
    pub fn is_orchestration(&self) -> bool {
        matches!(self, Self::Gating { .. } | Self::DeterminismConflict { .. })
    }

    /// Converts to a dictionary representation for API responses.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        let mut context = serde_json::Map::new();
        match self {
            Self::Gating {
                stage,
                unmet_dependency,
                ..
            } => {
                context.insert("stage".to_string(), serde_json::json!(stage));
                if let Some(dep) = unmet_dependency {
                    context.insert("unmet_dependency".to_string(), serde_json::json!(dep));
                }
            }
            Self::DeterminismConflict { stage, stage_id, .. } => {
                context.insert("stage".to_string(), serde_json::json!(stage));
                context.insert("stage_id".to_string(), serde_json::json!(stage_id));
            }
            Self::Cancellation { stage, .. } => {
                context.insert("stage".to_string(), serde_json::json!(stage));
            }
            Self::SchemaMismatch { table_id, .. } => {
                context.insert("table_id".to_string(), serde_json::json!(table_id));
            }
            Self::Validation {
                table_id,
                violations,
            } => {
                context.insert("table_id".to_string(), serde_json::json!(table_id));
                context.insert(
                    "rule_ids".to_string(),
                    serde_json::json!(violations.iter().map(|v| &v.rule_id).collect::<Vec<_>>()),
                );
            }
            Self::Input { path, .. } | Self::AdapterNotFound { path, .. } => {
                context.insert("path".to_string(), serde_json::json!(path));
            }
            Self::OverrideRejected { key, .. } => {
                context.insert("key".to_string(), serde_json::json!(key));
            }
            _ => {}
        }
        if !context.is_empty() {
            map.insert("context".to_string(), serde_json::Value::Object(context));
        }
        map
    }
}

/// A captured, serializable diagnostic for a failure that did not abort a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Error code (see [`DatError::code`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Table the diagnostic relates to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    /// File the diagnostic relates to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Diagnostic {
    /// Creates a warning-style diagnostic with a free-form code.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            table_id: None,
            file: None,
        }
    }

    /// Captures an error as a diagnostic.
    #[must_use]
    pub fn from_error(err: &DatError) -> Self {
        Self::new(err.code(), err.to_string())
    }

    /// Sets the table id.
    #[must_use]
    pub fn with_table(mut self, table_id: impl Into<String>) -> Self {
        self.table_id = Some(table_id.into());
        self
    }

    /// Sets the file.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gating_error_names_dependency() {
        let err = DatError::unmet_dependency(StageType::Export, StageType::Parse, "completed");
        assert!(err.to_string().contains("parse"));
        assert_eq!(err.code(), "DAT-GATING");
        assert!(err.is_orchestration());

        let dict = err.to_dict();
        let context = dict.get("context").unwrap();
        assert_eq!(context["unmet_dependency"], "parse");
    }

    #[test]
    fn test_validation_error_lists_every_rule() {
        let err = DatError::Validation {
            table_id: "metrics".to_string(),
            violations: vec![
                Violation::new("r1", "column 'x' missing"),
                Violation::new("r2", "3 rows out of range"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("[r1]"));
        assert!(msg.contains("[r2]"));
        assert_eq!(err.to_dict()["context"]["rule_ids"], serde_json::json!(["r1", "r2"]));
    }

    #[test]
    fn test_diagnostic_from_error() {
        let err = DatError::input("data/a.csv", "bad header");
        let diag = Diagnostic::from_error(&err).with_file("data/a.csv");
        assert_eq!(diag.code, "DAT-INPUT");
        assert_eq!(diag.file.as_deref(), Some("data/a.csv"));
    }
}
