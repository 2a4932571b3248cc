//! Column and row transformations.
//!
//! A table passes through seven steps in a fixed order:
//!
//! 1. column renames
//! 2. calculated columns
//! 3. type coercion
//! 4. unit normalization
//! 5. row filters
//! 6. missing-value normalization
//! 7. PII masking
//!
//! Masking runs last so no earlier step can reintroduce a raw value.

mod expr;
mod steps;

pub use expr::{round_to, truthy, Expression};
pub use steps::TransformStep;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::errors::Result;
use crate::frame::DataFrame;

/// A derived column computed from an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedColumn {
    /// Output column name (replaced if it exists).
    pub name: String,
    /// Expression source.
    pub expression: String,
    /// Decimal places to round numeric results to.
    #[serde(default)]
    pub round: Option<u32>,
}

/// Target of a type coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoerceTo {
    /// Whole number; fractional values are truncated.
    Integer,
    /// Floating point number.
    Number,
    /// Text.
    String,
    /// true/false (`yes`/`no`, `1`/`0` accepted).
    Boolean,
    /// ISO-8601 UTC text.
    Datetime,
    /// Upper-case text.
    Upper,
    /// Lower-case text.
    Lower,
}

/// A per-column type coercion. Values that cannot be coerced become null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coercion {
    /// Column to coerce.
    pub column: String,
    /// Target type.
    pub to: CoerceTo,
    /// `strftime` input format for datetime coercion.
    #[serde(default)]
    pub format: Option<String>,
}

/// What to do with a value whose unit has no conversion factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPolicy {
    /// Leave the value unconverted.
    #[default]
    Keep,
    /// Replace the value with null.
    Null,
    /// Fail the table.
    Error,
}

/// Converts a numeric column into a target unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitNormalization {
    /// Numeric column to convert.
    pub column: String,
    /// Fixed source unit for every row.
    #[serde(default)]
    pub unit: Option<String>,
    /// Column holding each row's source unit; rewritten to `target_unit`.
    #[serde(default)]
    pub unit_column: Option<String>,
    /// Unit after conversion.
    pub target_unit: String,
    /// Multiplier from each source unit into the target unit.
    #[serde(default)]
    pub factors: BTreeMap<String, f64>,
    /// Handling of unknown units.
    #[serde(default)]
    pub policy: UnitPolicy,
}

/// Whether matching rows are kept or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Keep rows where the expression is truthy.
    #[default]
    Keep,
    /// Drop rows where the expression is truthy.
    Drop,
}

/// A predicate-based row filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    /// Expression source.
    pub expression: String,
    /// Keep or drop matches.
    #[serde(default)]
    pub mode: FilterMode,
}

/// Sentinel values that mean "missing".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingValues {
    /// Values replaced with null. Text sentinels match case-insensitively.
    pub sentinels: Vec<serde_json::Value>,
    /// Columns to scan; all columns when empty.
    #[serde(default)]
    pub columns: Vec<String>,
}

fn default_replacement() -> String {
    "***".to_string()
}

/// Redaction of sensitive values.
///
/// With only `column`, every non-null cell of the column is replaced. With a
/// `pattern`, matches are replaced inside text cells (of `column` when given,
/// otherwise of every column).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiMask {
    /// Column to mask.
    #[serde(default)]
    pub column: Option<String>,
    /// Regular expression to redact.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Replacement text.
    #[serde(default = "default_replacement")]
    pub replacement: String,
}

/// The transform section of a table definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Old name to new name, applied in declaration order.
    #[serde(default)]
    pub renames: IndexMap<String, String>,
    /// Derived columns.
    #[serde(default)]
    pub calculated: Vec<CalculatedColumn>,
    /// Type coercions.
    #[serde(default)]
    pub coercions: Vec<Coercion>,
    /// Unit conversions.
    #[serde(default)]
    pub units: Vec<UnitNormalization>,
    /// Row filters.
    #[serde(default)]
    pub filters: Vec<RowFilter>,
    /// Missing-value sentinels.
    #[serde(default)]
    pub missing_values: Vec<MissingValues>,
    /// Redactions.
    #[serde(default)]
    pub pii: Vec<PiiMask>,
}

impl TransformConfig {
    /// Returns true if no transform is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
            && self.calculated.is_empty()
            && self.coercions.is_empty()
            && self.units.is_empty()
            && self.filters.is_empty()
            && self.missing_values.is_empty()
            && self.pii.is_empty()
    }

    /// Appends structural problems (bad expressions, patterns, factors).
    pub fn check(&self, table_id: &str, errors: &mut Vec<String>) {
        let expressions = self
            .calculated
            .iter()
            .map(|c| &c.expression)
            .chain(self.filters.iter().map(|f| &f.expression));
        for source in expressions {
            if let Err(e) = Expression::parse(source) {
                errors.push(format!("table '{table_id}': {e}"));
            }
        }
        for mask in &self.pii {
            match (&mask.column, &mask.pattern) {
                (None, None) => {
                    errors.push(format!("table '{table_id}': pii mask needs a column or a pattern"));
                }
                (_, Some(pattern)) => {
                    if let Err(e) = regex::Regex::new(pattern) {
                        errors.push(format!("table '{table_id}': pii pattern: {e}"));
                    }
                }
                (Some(_), None) => {}
            }
        }
        for unit in &self.units {
            if unit.unit.is_none() && unit.unit_column.is_none() {
                errors.push(format!(
                    "table '{table_id}': unit normalization of '{}' needs 'unit' or 'unit_column'",
                    unit.column
                ));
            }
            if unit.factors.values().any(|f| !f.is_finite()) {
                errors.push(format!(
                    "table '{table_id}': non-finite unit factor for '{}'",
                    unit.column
                ));
            }
        }
    }

    /// Returns the column names this config reads before any rename.
    ///
    /// Calculated and renamed columns produced by earlier steps are excluded.
    #[must_use]
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut produced: Vec<&str> = self.renames.values().map(String::as_str).collect();
        let mut out: Vec<String> = self.renames.keys().cloned().collect();
        fn push(name: &str, produced: &[&str], out: &mut Vec<String>) {
            if !produced.contains(&name) && !out.iter().any(|c| c == name) {
                out.push(name.to_string());
            }
        }
        for calc in &self.calculated {
            if let Ok(expr) = Expression::parse(&calc.expression) {
                for col in expr.columns() {
                    push(&col, &produced, &mut out);
                }
            }
            produced.push(&calc.name);
        }
        for coercion in &self.coercions {
            push(&coercion.column, &produced, &mut out);
        }
        for unit in &self.units {
            push(&unit.column, &produced, &mut out);
            if let Some(col) = &unit.unit_column {
                push(col, &produced, &mut out);
            }
        }
        out
    }
}

/// The ordered composition of transform steps for one table.
#[derive(Debug, Clone, Default)]
pub struct TransformPipeline {
    steps: Vec<TransformStep>,
}

impl TransformPipeline {
    /// Builds the pipeline for a table config plus profile-wide row filters.
    ///
    /// # Errors
    ///
    /// Returns an error if an expression or pattern fails to compile.
    pub fn new(config: &TransformConfig, global_filters: &[RowFilter]) -> Result<Self> {
        let mut steps = Vec::new();
        if !config.renames.is_empty() {
            steps.push(TransformStep::rename(&config.renames));
        }
        for calc in &config.calculated {
            steps.push(TransformStep::calculate(calc)?);
        }
        for coercion in &config.coercions {
            steps.push(TransformStep::Coerce(coercion.clone()));
        }
        for unit in &config.units {
            steps.push(TransformStep::Unit(unit.clone()));
        }
        for filter in config.filters.iter().chain(global_filters) {
            steps.push(TransformStep::filter(filter)?);
        }
        for missing in &config.missing_values {
            steps.push(TransformStep::Missing(missing.clone()));
        }
        for mask in &config.pii {
            steps.push(TransformStep::mask(mask)?);
        }
        Ok(Self { steps })
    }

    /// Returns the steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    /// Applies every step in order.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub fn apply(&self, mut df: DataFrame) -> Result<DataFrame> {
        for step in &self.steps {
            let before = df.row_count();
            df = step.apply(df)?;
            debug!(
                step = step.name(),
                rows_before = before,
                rows_after = df.row_count(),
                "Transform step applied"
            );
        }
        Ok(df)
    }
}
