//! Lock requests: the caller's choices for each stage.
//!
//! Upstream stage ids are never part of a request; the orchestrator resolves
//! them from the run before computing the stage id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::core::StageType;

/// Probe options of the Table Availability stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOptions {
    /// Per-file probe timeout; the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Options of the Parse stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseOptions {
    /// Abort the stage on the first table failure instead of recording a
    /// diagnostic.
    #[serde(default)]
    pub fail_fast: bool,
}

/// A file format written by Export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Apache Parquet.
    Parquet,
    /// Comma-separated values with a header row.
    Csv,
    /// A JSON array of row objects.
    Json,
}

impl ExportFormat {
    /// Returns the file extension (and wire name).
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Parquet => "parquet",
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A request to lock one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageRequest {
    /// Enumerate files under `root`.
    Discovery {
        /// Workspace-relative directory.
        #[serde(default)]
        root: String,
        /// Glob patterns a file must match (any).
        #[serde(default)]
        include: Vec<String>,
        /// Glob patterns a file must not match.
        #[serde(default)]
        exclude: Vec<String>,
        /// Descend into subdirectories.
        #[serde(default = "default_recursive")]
        recursive: bool,
    },
    /// Choose files and the profile.
    Selection {
        /// Discovered files to keep; empty applies the profile's population
        /// strategy.
        #[serde(default)]
        files: Vec<String>,
        /// Profile name; the latest published version is bound.
        profile: String,
    },
    /// Resolve per-file context with caller overrides.
    Context {
        /// Override values by key, checked against the profile allow-list.
        #[serde(default)]
        overrides: BTreeMap<String, Value>,
    },
    /// Probe the selected files.
    TableAvailability {
        /// Probe options.
        #[serde(default)]
        probe: ProbeOptions,
    },
    /// Choose tables.
    TableSelection {
        /// Available table ids to keep; empty keeps all.
        #[serde(default)]
        tables: Vec<String>,
    },
    /// Sample extraction of the selected tables.
    Preview {
        /// Rows kept per table and file.
        #[serde(default = "default_preview_rows")]
        max_rows: usize,
    },
    /// Profile-driven extraction.
    Parse {
        /// Parse options.
        #[serde(default)]
        options: ParseOptions,
    },
    /// Materialize the outputs.
    Export {
        /// Formats to write.
        formats: Vec<ExportFormat>,
        /// Workspace-relative output directory.
        output_path: String,
        /// Free text for the `{text}` file name token. Not part of the
        /// stage id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

fn default_recursive() -> bool {
    true
}

fn default_preview_rows() -> usize {
    20
}

impl StageRequest {
    /// Returns the stage the request locks.
    #[must_use]
    pub fn stage(&self) -> StageType {
        match self {
            Self::Discovery { .. } => StageType::Discovery,
            Self::Selection { .. } => StageType::Selection,
            Self::Context { .. } => StageType::Context,
            Self::TableAvailability { .. } => StageType::TableAvailability,
            Self::TableSelection { .. } => StageType::TableSelection,
            Self::Preview { .. } => StageType::Preview,
            Self::Parse { .. } => StageType::Parse,
            Self::Export { .. } => StageType::Export,
        }
    }

    /// Recursive discovery of every file under `root`.
    #[must_use]
    pub fn discovery(root: impl Into<String>) -> Self {
        Self::Discovery {
            root: root.into(),
            include: Vec::new(),
            exclude: Vec::new(),
            recursive: true,
        }
    }

    /// Selection of `files` with the latest version of `profile`.
    #[must_use]
    pub fn selection<S: Into<String>>(files: impl IntoIterator<Item = S>, profile: impl Into<String>) -> Self {
        Self::Selection {
            files: files.into_iter().map(Into::into).collect(),
            profile: profile.into(),
        }
    }

    /// Table selection of `tables`.
    #[must_use]
    pub fn tables<S: Into<String>>(tables: impl IntoIterator<Item = S>) -> Self {
        Self::TableSelection {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse with default options.
    #[must_use]
    pub fn parse() -> Self {
        Self::Parse {
            options: ParseOptions::default(),
        }
    }

    /// Export of `formats` into `output_path`.
    #[must_use]
    pub fn export(formats: &[ExportFormat], output_path: impl Into<String>) -> Self {
        Self::Export {
            formats: formats.to_vec(),
            output_path: output_path.into(),
            text: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request: StageRequest = serde_json::from_value(json!({
            "stage": "table_availability",
            "probe": {"timeout_ms": 250}
        }))
        .unwrap();
        assert_eq!(
            request,
            StageRequest::TableAvailability {
                probe: ProbeOptions { timeout_ms: Some(250) }
            }
        );
        assert_eq!(request.stage(), StageType::TableAvailability);

        let request: StageRequest = serde_json::from_value(json!({"stage": "discovery"})).unwrap();
        assert_eq!(request, StageRequest::discovery(""));
    }

    #[test]
    fn test_export_format_names() {
        let formats: Vec<ExportFormat> = serde_json::from_value(json!(["csv", "parquet"])).unwrap();
        assert_eq!(formats, vec![ExportFormat::Csv, ExportFormat::Parquet]);
        assert_eq!(ExportFormat::Json.to_string(), "json");
    }
}
