//! Profile-driven table extraction.
//!
//! [`extract_table`] dispatches a table definition to its strategy and then
//! reconciles the result with the table's stable column set.

mod strategy;

pub use strategy::{
    ArrayOfObjects, Extraction, FlatObject, HeadersData, Join, Orientation, RepeatOver, Scope, Strategy,
    Unpivot,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::context::ExtractionContext;
use crate::errors::{DatError, Diagnostic, Result};
use crate::frame::DataFrame;
use crate::profile::TableDef;

/// How a column mismatch against the stable set is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StableMode {
    /// Log and keep the extracted columns.
    #[default]
    Warn,
    /// Abort the table's extraction.
    Error,
    /// Silently reindex to the canonical columns.
    Ignore,
}

/// The canonical column list of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableColumns {
    /// Canonical columns, in order.
    pub columns: Vec<String>,
    /// Mismatch policy.
    #[serde(default)]
    pub mode: StableMode,
}

impl StableColumns {
    /// Reconciles `df` with the canonical columns.
    ///
    /// On an exact match (ignoring order) the table is reordered to the
    /// canonical order.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::SchemaMismatch`] on a mismatch in `error` mode.
    pub fn apply(&self, table_id: &str, df: DataFrame) -> Result<(DataFrame, Option<Diagnostic>)> {
        let missing: Vec<String> = self
            .columns
            .iter()
            .filter(|c| !df.has_column(c))
            .cloned()
            .collect();
        let extra: Vec<String> = df
            .columns()
            .iter()
            .filter(|c| !self.columns.contains(c))
            .cloned()
            .collect();

        if missing.is_empty() && extra.is_empty() {
            return Ok((df.reindex(&self.columns), None));
        }
        match self.mode {
            StableMode::Ignore => {
                debug!(table_id, ?missing, ?extra, "Reindexed to stable columns");
                Ok((df.reindex(&self.columns), None))
            }
            StableMode::Warn => {
                warn!(table_id, ?missing, ?extra, "Extracted columns differ from stable columns");
                let diagnostic = Diagnostic::new(
                    "DAT-SCHEMA-MISMATCH",
                    format!("missing {missing:?}, unexpected {extra:?}"),
                )
                .with_table(table_id);
                Ok((df, Some(diagnostic)))
            }
            StableMode::Error => Err(DatError::SchemaMismatch {
                table_id: table_id.to_string(),
                missing,
                extra,
            }),
        }
    }
}

/// A table extracted from one source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTable {
    /// Table id from the profile.
    pub table_id: String,
    /// Workspace-relative source file.
    pub source: String,
    /// The data.
    pub dataframe: DataFrame,
    /// Column names after reconciliation.
    pub column_set: Vec<String>,
    /// Non-fatal problems.
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    /// Resolved context of the source file.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl ExtractedTable {
    /// Creates a table record; the column set is taken from the data.
    #[must_use]
    pub fn new(table_id: impl Into<String>, source: impl Into<String>, dataframe: DataFrame) -> Self {
        let column_set = dataframe.columns().to_vec();
        Self {
            table_id: table_id.into(),
            source: source.into(),
            dataframe,
            column_set,
            diagnostics: Vec::new(),
            context: Map::new(),
        }
    }

    /// Replaces the data, refreshing the column set.
    pub fn set_dataframe(&mut self, dataframe: DataFrame) {
        self.column_set = dataframe.columns().to_vec();
        self.dataframe = dataframe;
    }

    /// Returns the row count.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.dataframe.row_count()
    }
}

/// Extracts one table from a parsed document.
///
/// # Errors
///
/// Returns [`DatError::Extraction`] for a shape mismatch or
/// [`DatError::SchemaMismatch`] under the `error` stable-columns mode.
pub fn extract_table(table: &TableDef, document: &Value, context: &ExtractionContext) -> Result<ExtractedTable> {
    let scope = Scope::new(context.to_map());
    let df = table.extraction.extract(document, &scope)?;
    let mut extracted = ExtractedTable::new(&table.id, &context.file, df);
    extracted.context = context.to_map();

    if extracted.dataframe.is_empty() {
        extracted.diagnostics.push(
            Diagnostic::new("DAT-EMPTY", "extraction produced no rows")
                .with_table(&table.id)
                .with_file(&context.file),
        );
    }

    if let Some(stable) = &table.stable_columns {
        let df = std::mem::take(&mut extracted.dataframe);
        let (df, diagnostic) = stable.apply(&table.id, df)?;
        extracted.set_dataframe(df);
        if let Some(diagnostic) = diagnostic {
            extracted.diagnostics.push(diagnostic.with_file(&context.file));
        }
    }

    debug!(
        table_id = %table.id,
        file = %context.file,
        strategy = table.extraction.strategy().kind(),
        rows = extracted.row_count(),
        "Table extracted"
    );
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(mode: &str) -> TableDef {
        serde_json::from_value(json!({
            "id": "sites",
            "extraction": {"strategy": "array_of_objects", "path": "$.sites"},
            "stable_columns": {"columns": ["site", "value", "unit"], "mode": mode}
        }))
        .unwrap()
    }

    fn document() -> Value {
        json!({"sites": [{"value": 1.5, "site": 1, "extra": true}]})
    }

    fn context() -> ExtractionContext {
        ExtractionContext {
            file: "data/a.json".to_string(),
            ..ExtractionContext::default()
        }
    }

    #[test]
    fn test_stable_columns_ignore_reindexes() {
        let out = extract_table(&table("ignore"), &document(), &context()).unwrap();
        assert_eq!(out.column_set, vec!["site", "value", "unit"]);
        assert_eq!(out.dataframe.get(0, "unit"), Some(&json!(null)));
        assert!(out.diagnostics.is_empty());
        assert_eq!(out.source, "data/a.json");
    }

    #[test]
    fn test_stable_columns_warn_keeps_actual() {
        let out = extract_table(&table("warn"), &document(), &context()).unwrap();
        assert_eq!(out.column_set, vec!["value", "site", "extra"]);
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].code, "DAT-SCHEMA-MISMATCH");
    }

    #[test]
    fn test_stable_columns_error_aborts() {
        let err = extract_table(&table("error"), &document(), &context()).unwrap_err();
        match err {
            DatError::SchemaMismatch { table_id, missing, extra } => {
                assert_eq!(table_id, "sites");
                assert_eq!(missing, vec!["unit"]);
                assert_eq!(extra, vec!["extra"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exact_match_reorders() {
        let stable = StableColumns {
            columns: vec!["b".to_string(), "a".to_string()],
            mode: StableMode::Error,
        };
        let df = DataFrame::from_rows(vec!["a".into(), "b".into()], vec![vec![json!(1), json!(2)]]);
        let (df, diag) = stable.apply("t", df).unwrap();
        assert_eq!(df.columns(), &["b", "a"]);
        assert!(diag.is_none());
    }
}
