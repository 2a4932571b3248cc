//! Rule evaluation and failure-policy application.

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

use super::rules::{AggregateRule, AggregateStat, ColumnType, OnFail, RowCheck, SchemaCheck, ValidationConfig};
use super::{RuleClass, ValidationReport, Violation};
use crate::errors::{DatError, Result};
use crate::frame::{value, DataFrame};
use crate::transform::Expression;
use crate::utils::parse_datetime;

/// Result of validating a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// What was checked and what failed.
    pub report: ValidationReport,
    /// Rows that continue through the pipeline.
    pub passed: DataFrame,
    /// Rows moved aside by `quarantine` rules.
    pub quarantined: Option<DataFrame>,
    /// Per input row, whether it ended up in `passed`.
    pub kept: Vec<bool>,
}

fn type_matches(v: &Value, expected: ColumnType) -> bool {
    match expected {
        ColumnType::Integer => {
            v.as_i64().is_some()
                || v.as_f64().is_some_and(|f| f.fract() == 0.0)
                || v.as_str().is_some_and(|s| s.trim().parse::<i64>().is_ok())
        }
        ColumnType::Number => value::as_f64(v).is_some() && !v.is_boolean(),
        ColumnType::String => v.is_string(),
        ColumnType::Boolean => v.is_boolean(),
        ColumnType::Datetime => v.as_str().is_some_and(|s| parse_datetime(s, None).is_ok()),
    }
}

/// Evaluates a schema check, returning the failure message if any.
fn check_schema(df: &DataFrame, check: &SchemaCheck) -> Option<String> {
    match check {
        SchemaCheck::RequiredColumns { columns } => {
            let missing: Vec<&String> = columns.iter().filter(|c| !df.has_column(c)).collect();
            (!missing.is_empty()).then(|| format!("missing required columns {missing:?}"))
        }
        SchemaCheck::ColumnTypes { types } => {
            let mut problems = Vec::new();
            for (column, expected) in types {
                match df.column_values(column) {
                    None => problems.push(format!("column '{column}' missing")),
                    Some(values) => {
                        let bad = values
                            .iter()
                            .filter(|v| !v.is_null() && !type_matches(v, *expected))
                            .count();
                        if bad > 0 {
                            problems.push(format!("{bad} values in '{column}' are not {expected:?}"));
                        }
                    }
                }
            }
            (!problems.is_empty()).then(|| problems.join("; "))
        }
        SchemaCheck::Unique { columns } => {
            if let Some(missing) = columns.iter().find(|c| !df.has_column(c)) {
                return Some(format!("key column '{missing}' missing"));
            }
            let idx: Vec<usize> = columns.iter().filter_map(|c| df.column_index(c)).collect();
            let mut seen = HashSet::new();
            let duplicates = df
                .rows()
                .iter()
                .filter(|row| {
                    let key: Vec<String> = idx.iter().map(|&i| value::key_text(&row[i])).collect();
                    !seen.insert(key)
                })
                .count();
            (duplicates > 0).then(|| format!("{duplicates} duplicate keys on {columns:?}"))
        }
    }
}

/// Evaluates a row check into a pass mask, or an error message when the
/// rule cannot be evaluated at all.
fn check_rows(df: &DataFrame, check: &RowCheck) -> std::result::Result<Vec<bool>, String> {
    let column = |name: &str| {
        df.column_values(name)
            .ok_or_else(|| format!("column '{name}' missing"))
    };
    match check {
        RowCheck::Range { column: name, min, max } => Ok(column(name)?
            .into_iter()
            .map(|v| {
                if v.is_null() {
                    return true;
                }
                value::as_f64(v).is_some_and(|n| {
                    min.map_or(true, |lo| n >= lo) && max.map_or(true, |hi| n <= hi)
                })
            })
            .collect()),
        RowCheck::NotNull { columns } => {
            let mut mask = vec![true; df.row_count()];
            for name in columns {
                for (slot, v) in mask.iter_mut().zip(column(name)?) {
                    *slot &= !v.is_null();
                }
            }
            Ok(mask)
        }
        RowCheck::Regex { column: name, pattern } => {
            let re = Regex::new(pattern).map_err(|e| e.to_string())?;
            Ok(column(name)?
                .into_iter()
                .map(|v| v.is_null() || re.is_match(&value::to_text(v)))
                .collect())
        }
        RowCheck::Predicate { expression } => Expression::parse(expression)
            .and_then(|e| e.mask(df))
            .map_err(|e| e.to_string()),
    }
}

/// Computes an aggregate statistic.
#[must_use]
pub fn aggregate(df: &DataFrame, rule: &AggregateRule) -> Option<f64> {
    let values: Vec<&Value> = match &rule.column {
        Some(column) => df.column_values(column)?,
        None if rule.stat == AggregateStat::Count => {
            #[allow(clippy::cast_precision_loss)]
            let count = df.row_count() as f64;
            return Some(count);
        }
        None => return None,
    };
    let numbers: Vec<f64> = values.iter().filter_map(|v| value::as_f64(v)).collect();
    #[allow(clippy::cast_precision_loss)]
    let stat = match rule.stat {
        AggregateStat::Count => values.iter().filter(|v| !v.is_null()).count() as f64,
        AggregateStat::Sum => numbers.iter().sum(),
        AggregateStat::Mean => {
            if numbers.is_empty() {
                return None;
            }
            numbers.iter().sum::<f64>() / numbers.len() as f64
        }
        AggregateStat::Min => numbers.iter().copied().reduce(f64::min)?,
        AggregateStat::Max => numbers.iter().copied().reduce(f64::max)?,
        AggregateStat::NullFraction => {
            if values.is_empty() {
                0.0
            } else {
                values.iter().filter(|v| v.is_null()).count() as f64 / values.len() as f64
            }
        }
        AggregateStat::DistinctCount => values
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| value::key_text(v))
            .collect::<HashSet<_>>()
            .len() as f64,
    };
    Some(stat)
}

/// Validates a table against its rules and applies the failure policies.
///
/// Every rule is evaluated before any policy is applied, so a `stop`
/// failure reports all violated rules. Aggregates are computed over the rows
/// that survive row-level quarantine.
///
/// # Errors
///
/// Returns [`DatError::Validation`] when any violated rule has `on_fail: stop`.
pub fn validate(table_id: &str, df: &DataFrame, config: &ValidationConfig) -> Result<ValidationOutcome> {
    let mut violations: Vec<Violation> = Vec::new();
    let mut quarantine_all = false;
    let rows = df.row_count();

    for rule in &config.schema {
        if let Some(message) = check_schema(df, &rule.check) {
            if rule.on_fail == OnFail::Quarantine {
                quarantine_all = true;
            }
            violations.push(
                Violation::new(&rule.id, message)
                    .with_class(RuleClass::Schema)
                    .with_policy(rule.on_fail)
                    .with_failed_rows(rows),
            );
        }
    }

    let mut keep = vec![true; rows];
    for rule in &config.rows {
        let (mask, message) = match check_rows(df, &rule.check) {
            Ok(mask) => {
                let failed = mask.iter().filter(|ok| !**ok).count();
                (mask, (failed > 0).then(|| format!("{failed} of {rows} rows failed")))
            }
            Err(message) => (vec![false; rows], Some(message)),
        };
        let Some(message) = message else { continue };
        let failed = mask.iter().filter(|ok| !**ok).count();
        if rule.on_fail == OnFail::Quarantine {
            for (slot, ok) in keep.iter_mut().zip(&mask) {
                *slot &= *ok;
            }
        }
        violations.push(
            Violation::new(&rule.id, message)
                .with_class(RuleClass::Row)
                .with_policy(rule.on_fail)
                .with_failed_rows(failed),
        );
    }
    if quarantine_all {
        keep = vec![false; rows];
    }
    let (survivors, _) = df.partition(&keep);

    for rule in &config.aggregates {
        let stat = aggregate(&survivors, rule);
        let message = match stat {
            None => Some("statistic could not be computed".to_string()),
            Some(s) if rule.min.is_some_and(|lo| s < lo) || rule.max.is_some_and(|hi| s > hi) => Some(format!(
                "{:?} = {s} outside [{}, {}]",
                rule.stat,
                rule.min.map_or("-inf".to_string(), |v| v.to_string()),
                rule.max.map_or("inf".to_string(), |v| v.to_string()),
            )),
            Some(_) => None,
        };
        if let Some(message) = message {
            if rule.on_fail == OnFail::Quarantine {
                keep = vec![false; rows];
            }
            violations.push(
                Violation::new(&rule.id, message)
                    .with_class(RuleClass::Aggregate)
                    .with_policy(rule.on_fail)
                    .with_failed_rows(survivors.row_count()),
            );
        }
    }

    if violations.iter().any(|v| v.on_fail == OnFail::Stop) {
        return Err(DatError::Validation {
            table_id: table_id.to_string(),
            violations,
        });
    }
    for violation in violations.iter().filter(|v| v.on_fail == OnFail::Continue) {
        warn!(
            table_id = %table_id,
            rule_id = %violation.rule_id,
            "Validation rule failed (continuing): {}", violation.message
        );
    }

    let (passed, failed) = df.partition(&keep);
    let quarantined = (failed.row_count() > 0).then_some(failed);
    let report = ValidationReport {
        table_id: table_id.to_string(),
        rules_checked: config.schema.len() + config.rows.len() + config.aggregates.len(),
        input_rows: rows,
        passed_rows: passed.row_count(),
        quarantined_rows: quarantined.as_ref().map_or(0, DataFrame::row_count),
        violations,
    };
    Ok(ValidationOutcome {
        report,
        passed,
        quarantined,
        kept: keep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn table() -> DataFrame {
        DataFrame::from_rows(
            vec!["wafer".into(), "thickness".into()],
            vec![
                vec![json!("W1"), json!(10.0)],
                vec![json!("W2"), json!(55.0)],
                vec![json!("W3"), Value::Null],
                vec![json!("W4"), json!(-1.0)],
                vec![json!("W5"), json!(12.0)],
            ],
        )
    }

    fn config(value: Value) -> ValidationConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_stop_reports_every_violated_rule() {
        let cfg = config(json!({
            "schema": [{"id": "need_lot", "check": "required_columns", "columns": ["lot"]}],
            "rows": [
                {"id": "thick_range", "check": "range", "column": "thickness", "min": 0, "max": 50},
                {"id": "thick_present", "check": "not_null", "columns": ["thickness"], "on_fail": "continue"}
            ]
        }));
        let err = validate("metrics", &table(), &cfg).unwrap_err();
        let DatError::Validation { table_id, violations } = err else {
            panic!("expected a validation error");
        };
        assert_eq!(table_id, "metrics");
        let ids: Vec<&str> = violations.iter().map(|v| v.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["need_lot", "thick_range", "thick_present"]);
    }

    #[test]
    fn test_quarantine_partitions_sum_to_input() {
        let cfg = config(json!({
            "rows": [{"id": "thick_range", "check": "range", "column": "thickness",
                      "min": 0, "max": 50, "on_fail": "quarantine"}],
            "quarantine_table": "metrics_rejected"
        }));
        let df = table();
        let outcome = validate("metrics", &df, &cfg).unwrap();
        let quarantined = outcome.quarantined.unwrap();
        assert_eq!(outcome.passed.row_count() + quarantined.row_count(), df.row_count());
        assert_eq!(quarantined.row_count(), 2);
        assert_eq!(outcome.report.quarantined_rows, 2);
        assert_eq!(outcome.report.violations[0].failed_rows, 2);
        assert_eq!(outcome.kept, vec![true, false, true, false, true]);
    }

    #[test]
    fn test_continue_keeps_table() {
        let cfg = config(json!({
            "rows": [{"id": "p", "check": "predicate", "expression": "thickness > 11", "on_fail": "continue"}],
            "aggregates": [{"id": "n", "stat": "count", "min": 10, "on_fail": "continue"}]
        }));
        let outcome = validate("metrics", &table(), &cfg).unwrap();
        assert_eq!(outcome.passed.row_count(), 5);
        assert!(outcome.quarantined.is_none());
        assert_eq!(outcome.report.violations.len(), 2);
    }

    #[test]
    fn test_schema_checks() {
        let df = table();
        let types = SchemaCheck::ColumnTypes {
            types: [("thickness".to_string(), ColumnType::Number)].into_iter().collect(),
        };
        assert_eq!(check_schema(&df, &types), None);
        let unique = SchemaCheck::Unique {
            columns: vec!["wafer".into()],
        };
        assert_eq!(check_schema(&df, &unique), None);
        let dup = DataFrame::concat(&[df.clone(), df.head(1)]);
        assert!(check_schema(&dup, &unique).is_some());
    }

    #[test]
    fn test_aggregate_quarantine_moves_whole_table() {
        let cfg = config(json!({
            "aggregates": [{"id": "mean", "column": "thickness", "stat": "mean", "max": 5, "on_fail": "quarantine"}],
            "quarantine_table": "q"
        }));
        let outcome = validate("metrics", &table(), &cfg).unwrap();
        assert_eq!(outcome.passed.row_count(), 0);
        assert_eq!(outcome.quarantined.unwrap().row_count(), 5);
        assert!(outcome.kept.iter().all(|k| !k));
    }
}
