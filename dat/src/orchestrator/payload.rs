//! Structured stage results persisted as `payload.json`.
//!
//! A payload is what a later stage (or an idempotent re-lock) reads back
//! instead of redoing the work. Most payloads also have a tabular view that
//! is written next to it as `data.parquet`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::request::ExportFormat;
use super::source::FileMeta;
use crate::adapters::TableProbe;
use crate::context::ExtractionContext;
use crate::core::{StageType, TableStatus};
use crate::errors::{DatError, Diagnostic, Result};
use crate::frame::DataFrame;
use crate::utils::format_manifest;
use crate::validation::ValidationReport;

/// Discovery result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    /// Workspace-relative root.
    pub root: String,
    /// Matching files, sorted by path.
    pub files: Vec<FileMeta>,
}

/// Selection result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionPayload {
    /// Bound profile name.
    pub profile: String,
    /// Bound profile content hash.
    pub profile_id: String,
    /// Bound profile version.
    pub profile_version: u32,
    /// Selected workspace-relative files, sorted.
    pub files: Vec<String>,
}

/// Context result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    /// Overrides applied to every file.
    pub overrides: BTreeMap<String, Value>,
    /// Resolved context per selected file.
    pub files: Vec<ExtractionContext>,
}

impl ContextPayload {
    /// Returns the context resolved for `file`.
    #[must_use]
    pub fn for_file(&self, file: &str) -> Option<&ExtractionContext> {
        self.files.iter().find(|c| c.file == file)
    }
}

/// Probe outcome of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAvailability {
    /// Workspace-relative file.
    pub file: String,
    /// Canonical status.
    pub status: TableStatus,
    /// Columns found.
    pub column_count: Option<usize>,
    /// Estimated rows.
    pub row_estimate: Option<usize>,
    /// Failure message, for MISSING and ERROR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-sheet probes of multi-table files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sheets: Vec<TableProbe>,
}

/// Table Availability result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableAvailabilityPayload {
    /// Probe outcome per selected file, in selection order.
    pub files: Vec<FileAvailability>,
    /// Profile tables that can be selected; empty when no file is usable.
    pub tables: Vec<String>,
}

/// Table Selection result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSelectionPayload {
    /// Selected table ids, in profile order.
    pub tables: Vec<String>,
}

/// Sample rows of one table from one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewTable {
    /// Table id.
    pub table_id: String,
    /// Source file.
    pub source: String,
    /// Rows in the full extraction.
    pub total_rows: usize,
    /// Sample rows as objects.
    pub rows: Vec<Value>,
    /// Extraction diagnostics.
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

/// Preview result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewPayload {
    /// Samples, per table then file.
    pub tables: Vec<PreviewTable>,
    /// Files or tables that could not be previewed.
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

/// A table or output persisted by Parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTable {
    /// Table id or output name.
    pub name: String,
    /// Row count.
    pub rows: usize,
    /// Column names.
    pub columns: Vec<String>,
    /// Workspace-relative Parquet file; absent for a table without columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Parse result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsePayload {
    /// Committed tables, in commit order (quarantine tables included).
    pub tables: Vec<PersistedTable>,
    /// Combined outputs.
    pub outputs: Vec<PersistedTable>,
    /// Validation summaries.
    #[serde(default)]
    pub validation: Vec<ValidationReport>,
    /// Captured failures that did not abort the stage.
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl ParsePayload {
    /// Returns the committed table named `name`.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&PersistedTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns the output named `name`.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&PersistedTable> {
        self.outputs.iter().find(|t| t.name == name)
    }
}

/// One file written by Export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFile {
    /// Output name.
    pub output: String,
    /// Written format.
    pub format: ExportFormat,
    /// Workspace-relative path.
    pub path: String,
    /// Rows written.
    pub rows: usize,
}

/// Export result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportPayload {
    /// Workspace-relative output directory.
    pub output_path: String,
    /// Written files.
    pub files: Vec<ExportedFile>,
}

/// The persisted result of any stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePayload {
    /// Discovery.
    Discovery(DiscoveryPayload),
    /// Selection.
    Selection(SelectionPayload),
    /// Context.
    Context(ContextPayload),
    /// Table Availability.
    TableAvailability(TableAvailabilityPayload),
    /// Table Selection.
    TableSelection(TableSelectionPayload),
    /// Preview.
    Preview(PreviewPayload),
    /// Parse.
    Parse(ParsePayload),
    /// Export.
    Export(ExportPayload),
}

impl StagePayload {
    /// Returns the producing stage.
    #[must_use]
    pub fn stage(&self) -> StageType {
        match self {
            Self::Discovery(_) => StageType::Discovery,
            Self::Selection(_) => StageType::Selection,
            Self::Context(_) => StageType::Context,
            Self::TableAvailability(_) => StageType::TableAvailability,
            Self::TableSelection(_) => StageType::TableSelection,
            Self::Preview(_) => StageType::Preview,
            Self::Parse(_) => StageType::Parse,
            Self::Export(_) => StageType::Export,
        }
    }

    /// Returns the tabular view written as `data.parquet`, if the stage has one.
    #[must_use]
    pub fn tabular(&self) -> Option<DataFrame> {
        let columns = |names: &[&str]| names.iter().map(ToString::to_string).collect::<Vec<_>>();
        match self {
            Self::Discovery(p) => Some(DataFrame::from_rows(
                columns(&["relative_path", "size", "modified"]),
                p.files
                    .iter()
                    .map(|f| {
                        vec![
                            json!(f.relative_path),
                            json!(f.size),
                            f.modified.as_ref().map_or(Value::Null, |t| json!(format_manifest(t))),
                        ]
                    })
                    .collect(),
            )),
            Self::Selection(p) => Some(DataFrame::from_rows(
                columns(&["relative_path"]),
                p.files.iter().map(|f| vec![json!(f)]).collect(),
            )),
            Self::Context(p) => {
                let records: Vec<Value> = p
                    .files
                    .iter()
                    .map(|ctx| {
                        let mut record = ctx.to_map();
                        record.insert("file".to_string(), json!(ctx.file));
                        Value::Object(record)
                    })
                    .collect();
                let mut df = DataFrame::from_records(&records, None);
                let mut order = vec!["file".to_string()];
                order.extend(df.columns().iter().filter(|c| *c != "file").cloned());
                df = df.reindex(&order);
                Some(df)
            }
            Self::TableAvailability(p) => Some(DataFrame::from_rows(
                columns(&["file", "status", "column_count", "row_estimate", "error"]),
                p.files
                    .iter()
                    .map(|f| {
                        vec![
                            json!(f.file),
                            json!(f.status),
                            json!(f.column_count),
                            json!(f.row_estimate),
                            json!(f.error),
                        ]
                    })
                    .collect(),
            )),
            Self::TableSelection(p) => Some(DataFrame::from_rows(
                columns(&["table_id"]),
                p.tables.iter().map(|t| vec![json!(t)]).collect(),
            )),
            Self::Export(p) => Some(DataFrame::from_rows(
                columns(&["output", "format", "path", "rows"]),
                p.files
                    .iter()
                    .map(|f| vec![json!(f.output), json!(f.format), json!(f.path), json!(f.rows)])
                    .collect(),
            )),
            Self::Preview(_) | Self::Parse(_) => None,
        }
    }
}

macro_rules! payload_conversions {
    ($($variant:ident => $payload:ty),* $(,)?) => {$(
        impl TryFrom<StagePayload> for $payload {
            type Error = DatError;

            fn try_from(payload: StagePayload) -> Result<Self> {
                match payload {
                    StagePayload::$variant(inner) => Ok(inner),
                    other => Err(DatError::Internal(format!(
                        "expected a {} payload, found {}",
                        StageType::$variant,
                        other.stage()
                    ))),
                }
            }
        }
    )*};
}

payload_conversions! {
    Discovery => DiscoveryPayload,
    Selection => SelectionPayload,
    Context => ContextPayload,
    TableAvailability => TableAvailabilityPayload,
    TableSelection => TableSelectionPayload,
    Preview => PreviewPayload,
    Parse => ParsePayload,
    Export => ExportPayload,
}
