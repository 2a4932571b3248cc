//! File adapters.
//!
//! Every supported format implements [`FileAdapter`]: a metadata-only probe,
//! an eager read, a chunked stream and a structural validation. Adapters are
//! stateless and safe to share across runs and worker threads.

mod csv;
mod excel;
mod json;
mod parquet;
mod registry;

pub use self::csv::CsvAdapter;
pub use self::excel::ExcelAdapter;
pub use self::json::JsonAdapter;
pub use self::parquet::ParquetAdapter;
pub use registry::AdapterRegistry;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::core::TableStatus;
use crate::errors::{DatError, Result};
use crate::frame::DataFrame;

/// Probe outcome for one table inside a file (a sheet, or the file itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableProbe {
    /// Sheet or table name.
    pub name: String,
    /// Probe status.
    pub status: TableStatus,
    /// Column names, when known.
    pub columns: Vec<String>,
    /// Estimated row count, when known.
    pub row_estimate: Option<usize>,
    /// Error message for [`TableStatus::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Metadata-only inspection result of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Overall status.
    pub status: TableStatus,
    /// Column names of the primary table.
    pub columns: Vec<String>,
    /// Estimated row count of the primary table.
    pub row_estimate: Option<usize>,
    /// Error message when the probe failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-sheet results for multi-table formats.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableProbe>,
}

impl ProbeResult {
    /// Builds a result for a single-table file, deriving EMPTY from a zero row count.
    #[must_use]
    pub fn single(columns: Vec<String>, row_estimate: usize) -> Self {
        let status = if row_estimate == 0 {
            TableStatus::Empty
        } else {
            TableStatus::Available
        };
        Self {
            status,
            columns,
            row_estimate: Some(row_estimate),
            error: None,
            tables: Vec::new(),
        }
    }

    /// Builds a MISSING result.
    #[must_use]
    pub fn missing(path: &Path) -> Self {
        Self::failed(TableStatus::Missing, format!("file not found: {}", path.display()))
    }

    /// Builds an ERROR result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::failed(TableStatus::Error, message)
    }

    fn failed(status: TableStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            columns: Vec::new(),
            row_estimate: None,
            error: Some(message.into()),
            tables: Vec::new(),
        }
    }

    /// Builds a result from per-sheet probes.
    ///
    /// AVAILABLE when every sheet is readable and one has rows, PARTIAL when
    /// only some sheets are readable, EMPTY when none has rows, ERROR when
    /// none is readable.
    #[must_use]
    pub fn from_tables(tables: Vec<TableProbe>) -> Self {
        let readable: Vec<&TableProbe> = tables
            .iter()
            .filter(|t| t.status != TableStatus::Error)
            .collect();
        let with_rows = readable.iter().find(|t| t.status == TableStatus::Available);

        let status = if readable.is_empty() {
            TableStatus::Error
        } else if readable.len() < tables.len() {
            TableStatus::Partial
        } else if with_rows.is_some() {
            TableStatus::Available
        } else {
            TableStatus::Empty
        };
        let primary = with_rows.or_else(|| readable.first()).copied();
        let error = (status == TableStatus::Error).then(|| {
            tables
                .iter()
                .filter_map(|t| t.error.clone())
                .collect::<Vec<_>>()
                .join("; ")
        });
        Self {
            status,
            columns: primary.map(|t| t.columns.clone()).unwrap_or_default(),
            row_estimate: primary.and_then(|t| t.row_estimate),
            error,
            tables,
        }
    }
}

/// Options for eager and streamed reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Sheet to read (Excel); the first sheet when `None`.
    #[serde(default)]
    pub sheet: Option<String>,
    /// Stop after this many rows.
    #[serde(default)]
    pub max_rows: Option<usize>,
    /// Delimiter override (CSV); auto-detected when `None`.
    #[serde(default)]
    pub delimiter: Option<u8>,
}

impl ReadOptions {
    /// Limits the number of rows read.
    #[must_use]
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    /// Selects a sheet.
    #[must_use]
    pub fn with_sheet(mut self, sheet: impl Into<String>) -> Self {
        self.sheet = Some(sheet.into());
        self
    }
}

/// Statistics of an eager read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResult {
    /// Rows returned.
    pub rows_read: usize,
    /// True if `max_rows` cut the read short.
    pub truncated: bool,
    /// Non-fatal issues encountered.
    pub warnings: Vec<String>,
}

/// Structural validation outcome of a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileValidation {
    /// True when no errors were found.
    pub valid: bool,
    /// Fatal problems.
    pub errors: Vec<String>,
    /// Non-fatal problems.
    pub warnings: Vec<String>,
}

impl FileValidation {
    /// A passing validation.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    /// A failing validation with one error.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }
}

/// A boxed iterator of table chunks.
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<DataFrame>> + Send + 'a>;

/// Common capability set of every file format.
pub trait FileAdapter: Send + Sync {
    /// Adapter name for diagnostics.
    fn name(&self) -> &'static str;

    /// Lowercase file extensions handled, without the dot.
    fn extensions(&self) -> &'static [&'static str];

    /// MIME types handled.
    fn mime_types(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether [`FileAdapter::stream_dataframe`] is supported for `path`.
    fn supports_streaming(&self, path: &Path) -> bool;

    /// Inspects columns and row count without loading the full data.
    fn probe_schema(&self, path: &Path) -> ProbeResult;

    /// Reads the file into one table.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Input`] if the file is unreadable or malformed.
    fn read_dataframe(&self, path: &Path, options: &ReadOptions) -> Result<(DataFrame, ReadResult)>;

    /// Reads the file as a sequence of chunks of at most `chunk_size` rows.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Input`] if the format or file cannot be streamed.
    fn stream_dataframe<'a>(
        &'a self,
        path: &'a Path,
        options: &ReadOptions,
        chunk_size: usize,
    ) -> Result<ChunkIter<'a>>;

    /// Checks the file's structure.
    fn validate_file(&self, path: &Path) -> FileValidation;

    /// Reads the file as a JSON document for profile-driven extraction.
    ///
    /// Tabular formats yield an array of row objects; multi-sheet formats an
    /// object of sheet name to rows.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Input`] if the file is unreadable or malformed.
    fn read_document(&self, path: &Path) -> Result<Value> {
        let (df, _) = self.read_dataframe(path, &ReadOptions::default())?;
        Ok(Value::Array(df.to_records()))
    }
}

/// Error for adapters without streaming support.
pub(crate) fn streaming_unsupported(adapter: &str, path: &Path) -> DatError {
    DatError::input(
        path.display().to_string(),
        format!("{adapter} adapter does not support streaming for this file"),
    )
}

/// Splits an eager table into chunks.
pub(crate) fn chunk_frame(df: DataFrame, chunk_size: usize) -> Vec<DataFrame> {
    let chunk_size = chunk_size.max(1);
    let (columns, rows) = df.into_parts();
    if rows.is_empty() {
        return vec![DataFrame::new(columns)];
    }
    rows.chunks(chunk_size)
        .map(|chunk| DataFrame::from_rows(columns.clone(), chunk.to_vec()))
        .collect()
}

/// Adapts a chunk iterator to an async stream that yields to the runtime
/// between chunks.
pub fn chunk_stream(chunks: ChunkIter<'_>) -> impl Stream<Item = Result<DataFrame>> + '_ {
    stream::iter(chunks).then(|chunk| async move {
        tokio::task::yield_now().await;
        chunk
    })
}

/// Lowercase extension of a path, or the empty string.
#[must_use]
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(name: &str, status: TableStatus) -> TableProbe {
        TableProbe {
            name: name.to_string(),
            status,
            columns: vec!["a".to_string()],
            row_estimate: Some(usize::from(status == TableStatus::Available)),
            error: (status == TableStatus::Error).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn test_from_tables_statuses() {
        let all = ProbeResult::from_tables(vec![
            sheet("a", TableStatus::Available),
            sheet("b", TableStatus::Empty),
        ]);
        assert_eq!(all.status, TableStatus::Available);

        let partial = ProbeResult::from_tables(vec![
            sheet("a", TableStatus::Available),
            sheet("b", TableStatus::Error),
        ]);
        assert_eq!(partial.status, TableStatus::Partial);
        assert_eq!(partial.row_estimate, Some(1));

        let empty = ProbeResult::from_tables(vec![sheet("a", TableStatus::Empty)]);
        assert_eq!(empty.status, TableStatus::Empty);

        let failed = ProbeResult::from_tables(vec![sheet("a", TableStatus::Error)]);
        assert_eq!(failed.status, TableStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_chunk_frame() {
        let df = DataFrame::from_rows(
            vec!["x".to_string()],
            (0..5).map(|i| vec![Value::from(i)]).collect(),
        );
        let chunks = chunk_frame(df, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].row_count(), 1);
    }

    #[tokio::test]
    async fn test_chunk_stream_yields_all_chunks() {
        let chunks: ChunkIter<'_> = Box::new(
            chunk_frame(
                DataFrame::from_rows(vec!["x".into()], vec![vec![Value::from(1)]; 3]),
                1,
            )
            .into_iter()
            .map(Ok),
        );
        let collected: Vec<_> = chunk_stream(chunks).collect().await;
        assert_eq!(collected.len(), 3);
    }
}
