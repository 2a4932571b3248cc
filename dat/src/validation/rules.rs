//! Declarative validation rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What happens when a rule fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFail {
    /// Abort processing of the table and report every violated rule.
    #[default]
    Stop,
    /// Move failing rows to the quarantine table.
    Quarantine,
    /// Log and keep the table unmodified.
    Continue,
}

/// Expected type of a column's non-null values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Whole numbers.
    Integer,
    /// Any number (numeric strings included).
    Number,
    /// Text.
    String,
    /// true/false.
    Boolean,
    /// Parseable date or datetime text.
    Datetime,
}

/// A check evaluated once per table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum SchemaCheck {
    /// The listed columns must be present.
    RequiredColumns {
        /// Column names.
        columns: Vec<String>,
    },
    /// Declared column types.
    ColumnTypes {
        /// Column name to expected type.
        types: BTreeMap<String, ColumnType>,
    },
    /// The combination of the listed columns must be unique.
    Unique {
        /// Key columns.
        columns: Vec<String>,
    },
}

/// A check evaluated per row, producing a pass mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RowCheck {
    /// Numeric bounds (inclusive). Null values pass.
    Range {
        /// Column to check.
        column: String,
        /// Lower bound.
        #[serde(default)]
        min: Option<f64>,
        /// Upper bound.
        #[serde(default)]
        max: Option<f64>,
    },
    /// The listed columns must not be null.
    NotNull {
        /// Column names.
        columns: Vec<String>,
    },
    /// Text must match a regular expression. Null values pass.
    Regex {
        /// Column to check.
        column: String,
        /// Pattern the whole value is searched with.
        pattern: String,
    },
    /// An expression that must evaluate truthy.
    Predicate {
        /// Expression source.
        expression: String,
    },
}

/// Summary statistic for aggregate rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStat {
    /// Row count, or non-null count when a column is given.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Mean of numeric values.
    Mean,
    /// Minimum numeric value.
    Min,
    /// Maximum numeric value.
    Max,
    /// Fraction of null values.
    NullFraction,
    /// Number of distinct non-null values.
    DistinctCount,
}

/// A schema-level rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRule {
    /// Rule identifier reported in violations.
    pub id: String,
    /// The check.
    #[serde(flatten)]
    pub check: SchemaCheck,
    /// Failure policy.
    #[serde(default)]
    pub on_fail: OnFail,
}

/// A row-level rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRule {
    /// Rule identifier reported in violations.
    pub id: String,
    /// The check.
    #[serde(flatten)]
    pub check: RowCheck,
    /// Failure policy.
    #[serde(default)]
    pub on_fail: OnFail,
}

/// An aggregate rule: bounds on a summary statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRule {
    /// Rule identifier reported in violations.
    pub id: String,
    /// Column the statistic is computed over (`None` for row count).
    #[serde(default)]
    pub column: Option<String>,
    /// The statistic.
    pub stat: AggregateStat,
    /// Inclusive lower bound.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive upper bound.
    #[serde(default)]
    pub max: Option<f64>,
    /// Failure policy.
    #[serde(default)]
    pub on_fail: OnFail,
}

/// The validation section of a table definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Table-level rules.
    #[serde(default)]
    pub schema: Vec<SchemaRule>,
    /// Row-level rules.
    #[serde(default)]
    pub rows: Vec<RowRule>,
    /// Summary-statistic rules.
    #[serde(default)]
    pub aggregates: Vec<AggregateRule>,
    /// Table id the quarantined rows are kept under.
    #[serde(default)]
    pub quarantine_table: Option<String>,
}

impl ValidationConfig {
    /// Returns true if no rules are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schema.is_empty() && self.rows.is_empty() && self.aggregates.is_empty()
    }

    /// Returns true if any rule quarantines.
    #[must_use]
    pub fn quarantines(&self) -> bool {
        self.schema.iter().any(|r| r.on_fail == OnFail::Quarantine)
            || self.rows.iter().any(|r| r.on_fail == OnFail::Quarantine)
            || self.aggregates.iter().any(|r| r.on_fail == OnFail::Quarantine)
    }

    /// Appends structural problems (bad regexes, expressions, duplicate ids).
    pub fn check(&self, table_id: &str, errors: &mut Vec<String>) {
        let mut ids = std::collections::HashSet::new();
        let all_ids = self
            .schema
            .iter()
            .map(|r| &r.id)
            .chain(self.rows.iter().map(|r| &r.id))
            .chain(self.aggregates.iter().map(|r| &r.id));
        for id in all_ids {
            if !ids.insert(id) {
                errors.push(format!("table '{table_id}': duplicate validation rule id '{id}'"));
            }
        }
        for rule in &self.rows {
            match &rule.check {
                RowCheck::Regex { pattern, .. } => {
                    if let Err(e) = regex::Regex::new(pattern) {
                        errors.push(format!("table '{table_id}' rule '{}': {e}", rule.id));
                    }
                }
                RowCheck::Predicate { expression } => {
                    if let Err(e) = crate::transform::Expression::parse(expression) {
                        errors.push(format!("table '{table_id}' rule '{}': {e}", rule.id));
                    }
                }
                RowCheck::Range { min, max, .. } => {
                    if let (Some(lo), Some(hi)) = (min, max) {
                        if lo > hi {
                            errors.push(format!("table '{table_id}' rule '{}': min exceeds max", rule.id));
                        }
                    }
                }
                RowCheck::NotNull { .. } => {}
            }
        }
        if self.quarantines() && self.quarantine_table.is_none() {
            errors.push(format!(
                "table '{table_id}': quarantine rules require 'quarantine_table'"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rules_deserialize_flat() {
        let config: ValidationConfig = serde_json::from_value(json!({
            "schema": [{"id": "s1", "check": "required_columns", "columns": ["a"]}],
            "rows": [
                {"id": "r1", "check": "range", "column": "a", "min": 0, "on_fail": "quarantine"},
                {"id": "r2", "check": "predicate", "expression": "a > 1", "on_fail": "continue"}
            ],
            "aggregates": [{"id": "g1", "stat": "count", "min": 1}],
            "quarantine_table": "bad_rows"
        }))
        .unwrap();
        assert_eq!(config.rows[0].on_fail, OnFail::Quarantine);
        assert_eq!(config.schema[0].on_fail, OnFail::Stop);
        assert!(matches!(config.rows[0].check, RowCheck::Range { min: Some(m), .. } if m == 0.0));
        let mut errors = Vec::new();
        config.check("t", &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_check_reports_problems() {
        let config: ValidationConfig = serde_json::from_value(json!({
            "rows": [
                {"id": "r1", "check": "regex", "column": "a", "pattern": "("},
                {"id": "r1", "check": "predicate", "expression": "a >", "on_fail": "quarantine"}
            ]
        }))
        .unwrap();
        let mut errors = Vec::new();
        config.check("t", &mut errors);
        assert_eq!(errors.len(), 4);
    }
}
