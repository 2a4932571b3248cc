//! Profile document model and validation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::context::ContextConfig;
use crate::errors::{DatError, Result};
use crate::extract::{Extraction, StableColumns};
use crate::frame::{JoinKind, Reducer};
use crate::ids::content_hash;
use crate::transform::{Expression, RowFilter, TransformConfig};
use crate::utils::GlobFilter;
use crate::validation::ValidationConfig;

/// Length of a profile id (hex characters).
pub const PROFILE_ID_LENGTH: usize = 16;

fn default_version() -> u32 {
    1
}

/// Which files a profile applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    /// Glob patterns a file must match (any).
    #[serde(default)]
    pub include: Vec<String>,
    /// Glob patterns a file must not match.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Allowed extensions without the dot; any when empty.
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl DatasourceConfig {
    /// Compiles the include/exclude patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern fails to compile.
    pub fn filter(&self) -> Result<GlobFilter> {
        GlobFilter::new(&self.include, &self.exclude)
    }

    /// Returns true if `path` has an allowed extension.
    #[must_use]
    pub fn allows_extension(&self, path: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let ext = path
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        self.extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
    }
}

/// Which files are selected when the caller does not list them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PopulationStrategy {
    /// Every eligible file.
    #[default]
    All,
    /// The first `n` files in path order.
    FirstN {
        /// File count.
        n: usize,
    },
    /// The `n` most recently modified files.
    LatestN {
        /// File count.
        n: usize,
    },
}

/// Resource limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Governance {
    /// Maximum number of selected files.
    #[serde(default)]
    pub max_files: Option<usize>,
    /// Rows kept per extracted table; extra rows are dropped with a diagnostic.
    #[serde(default)]
    pub max_rows_per_table: Option<usize>,
}

/// One table the profile extracts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    /// Unique table id.
    pub id: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Extraction strategy.
    pub extraction: Extraction,
    /// Canonical column set and policy.
    #[serde(default)]
    pub stable_columns: Option<StableColumns>,
    /// Validation rules.
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Column transforms.
    #[serde(default)]
    pub transforms: TransformConfig,
}

impl TableDef {
    /// Columns the table is known to produce before transforms, if fixed.
    #[must_use]
    pub fn known_columns(&self) -> Option<Vec<String>> {
        self.stable_columns
            .as_ref()
            .map(|s| s.columns.clone())
            .or_else(|| self.extraction.strategy().declared_columns())
    }
}

/// A reducer applied to one column of a grouped output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerDef {
    /// Source column.
    pub column: String,
    /// Reducer function.
    pub function: Reducer,
    /// Output column; `<column>_<function>` when absent.
    #[serde(default)]
    pub alias: Option<String>,
}

impl ReducerDef {
    /// Returns the output column name.
    #[must_use]
    pub fn output_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.column, self.function.as_str()))
    }
}

/// Group-by aggregation of an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationDef {
    /// Key columns.
    pub group_by: Vec<String>,
    /// Reducers.
    pub reducers: Vec<ReducerDef>,
}

/// Join of two tables into an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputJoin {
    /// Left table id.
    pub left: String,
    /// Right table id.
    pub right: String,
    /// Key columns.
    pub on: Vec<String>,
    /// Join kind.
    #[serde(default)]
    pub how: JoinKind,
}

/// A named output built from extracted tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDef {
    /// Output name.
    pub name: String,
    /// Source table ids (concatenated, or the aggregation input).
    #[serde(default)]
    pub tables: Vec<String>,
    /// Add resolved context values as columns.
    #[serde(default)]
    pub include_context: bool,
    /// Group-by aggregation.
    #[serde(default)]
    pub aggregation: Option<AggregationDef>,
    /// Join of two tables.
    #[serde(default)]
    pub join: Option<OutputJoin>,
    /// File name template (see [`crate::output::render_file_name`]).
    #[serde(default)]
    pub file_name: Option<String>,
}

/// A versioned, declarative extraction profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name, unique within a store.
    pub name: String,
    /// Version, managed by the store.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// File eligibility.
    #[serde(default)]
    pub datasource: DatasourceConfig,
    /// Default file population.
    #[serde(default)]
    pub population: PopulationStrategy,
    /// Context keys.
    #[serde(default)]
    pub context: ContextConfig,
    /// Tables.
    pub tables: Vec<TableDef>,
    /// Row filters applied to every table.
    #[serde(default)]
    pub filters: Vec<RowFilter>,
    /// Outputs.
    #[serde(default)]
    pub outputs: Vec<OutputDef>,
    /// Presentation hints, opaque to the pipeline.
    #[serde(default)]
    pub ui: Map<String, Value>,
    /// Limits.
    #[serde(default)]
    pub governance: Governance,
}

impl Profile {
    /// Parses a profile from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Json`] on malformed documents.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Deterministic content hash of the profile, excluding its version.
    #[must_use]
    pub fn profile_id(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("version");
        }
        let mut hash = content_hash(&value);
        hash.truncate(PROFILE_ID_LENGTH);
        hash
    }

    /// Returns the table definition with `id`.
    #[must_use]
    pub fn table(&self, id: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.id == id)
    }

    /// Returns the table ids, including quarantine tables.
    #[must_use]
    pub fn table_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tables.iter().map(|t| t.id.clone()).collect();
        ids.extend(
            self.tables
                .iter()
                .filter_map(|t| t.validation.quarantine_table.clone()),
        );
        ids
    }

    /// Validates structure, references and syntax.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Profile`] listing every problem found.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.tables.is_empty() {
            errors.push("at least one table is required".to_string());
        }
        if let Err(e) = self.datasource.filter() {
            errors.push(format!("datasource: {e}"));
        }
        if let PopulationStrategy::FirstN { n: 0 } | PopulationStrategy::LatestN { n: 0 } = self.population {
            errors.push("population: n must be positive".to_string());
        }
        self.context.check(&mut errors);

        let mut ids = HashSet::new();
        for table in &self.tables {
            self.check_table(table, &mut ids, &mut errors);
        }
        for filter in &self.filters {
            if let Err(e) = Expression::parse(&filter.expression) {
                errors.push(format!("filters: {e}"));
            }
        }
        self.check_outputs(&ids, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DatError::Profile {
                profile: self.name.clone(),
                errors,
            })
        }
    }

    fn check_table<'a>(&'a self, table: &'a TableDef, ids: &mut HashSet<&'a str>, errors: &mut Vec<String>) {
        if table.id.trim().is_empty() {
            errors.push("table id must not be empty".to_string());
        }
        if !ids.insert(&table.id) {
            errors.push(format!("duplicate table id '{}'", table.id));
        }
        if let Some(quarantine) = &table.validation.quarantine_table {
            if !ids.insert(quarantine) {
                errors.push(format!("duplicate table id '{quarantine}' (quarantine table)"));
            }
        }

        let mut strategy_errors = Vec::new();
        table.extraction.strategy().check(&mut strategy_errors);
        errors.extend(
            strategy_errors
                .into_iter()
                .map(|e| format!("table '{}': {e}", table.id)),
        );
        table.validation.check(&table.id, errors);
        table.transforms.check(&table.id, errors);

        if let Some(known) = table.known_columns() {
            for column in table.transforms.referenced_columns() {
                if !known.contains(&column) {
                    errors.push(format!(
                        "table '{}': transform references unknown column '{column}'",
                        table.id
                    ));
                }
            }
        }
    }

    fn check_outputs(&self, ids: &HashSet<&str>, errors: &mut Vec<String>) {
        let mut names = HashSet::new();
        for output in &self.outputs {
            if !names.insert(output.name.as_str()) {
                errors.push(format!("duplicate output name '{}'", output.name));
            }
            for table in &output.tables {
                if !ids.contains(table.as_str()) {
                    errors.push(format!("output '{}': unknown table '{table}'", output.name));
                }
            }
            if output.aggregation.is_some() && output.join.is_some() {
                errors.push(format!(
                    "output '{}': aggregation and join are mutually exclusive",
                    output.name
                ));
            }
            if let Some(join) = &output.join {
                for side in [&join.left, &join.right] {
                    if !ids.contains(side.as_str()) {
                        errors.push(format!("output '{}': unknown join table '{side}'", output.name));
                    }
                }
                if join.on.is_empty() {
                    errors.push(format!("output '{}': join needs key columns", output.name));
                }
            } else if output.tables.is_empty() {
                errors.push(format!("output '{}': no source tables", output.name));
            }
            if let Some(template) = &output.file_name {
                if let Err(e) = crate::output::check_template(template) {
                    errors.push(format!("output '{}': {e}", output.name));
                }
            }
        }
    }
}
