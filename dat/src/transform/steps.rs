//! Individual transform steps. Each is a pure `table -> table` function.

use indexmap::IndexMap;
use regex::{NoExpand, Regex};
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    round_to, CalculatedColumn, CoerceTo, Coercion, Expression, FilterMode, MissingValues, PiiMask,
    RowFilter, UnitNormalization, UnitPolicy,
};
use crate::errors::{DatError, Result};
use crate::frame::{value, DataFrame};
use crate::utils::{format_manifest, parse_datetime};

/// One compiled step of a transform pipeline.
#[derive(Debug, Clone)]
pub enum TransformStep {
    /// Column renames.
    Rename(IndexMap<String, String>),
    /// A calculated column.
    Calculate {
        /// Output column.
        name: String,
        /// Compiled expression.
        expression: Expression,
        /// Decimal places.
        round: Option<u32>,
    },
    /// A type coercion.
    Coerce(Coercion),
    /// A unit conversion.
    Unit(UnitNormalization),
    /// A row filter.
    Filter {
        /// Compiled predicate.
        expression: Expression,
        /// Keep or drop matches.
        mode: FilterMode,
    },
    /// Sentinel replacement.
    Missing(MissingValues),
    /// Redaction.
    Mask {
        /// Targeted column.
        column: Option<String>,
        /// Compiled pattern.
        pattern: Option<Regex>,
        /// Replacement text.
        replacement: String,
    },
}

impl TransformStep {
    pub(super) fn rename(renames: &IndexMap<String, String>) -> Self {
        Self::Rename(renames.clone())
    }

    pub(super) fn calculate(calc: &CalculatedColumn) -> Result<Self> {
        Ok(Self::Calculate {
            name: calc.name.clone(),
            expression: Expression::parse(&calc.expression)?,
            round: calc.round,
        })
    }

    pub(super) fn filter(filter: &RowFilter) -> Result<Self> {
        Ok(Self::Filter {
            expression: Expression::parse(&filter.expression)?,
            mode: filter.mode,
        })
    }

    pub(super) fn mask(mask: &PiiMask) -> Result<Self> {
        let pattern = mask.pattern.as_deref().map(Regex::new).transpose()?;
        Ok(Self::Mask {
            column: mask.column.clone(),
            pattern,
            replacement: mask.replacement.clone(),
        })
    }

    /// Returns the step name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rename(_) => "rename",
            Self::Calculate { .. } => "calculate",
            Self::Coerce(_) => "coerce",
            Self::Unit(_) => "unit",
            Self::Filter { .. } => "filter",
            Self::Missing(_) => "missing_values",
            Self::Mask { .. } => "pii_mask",
        }
    }

    /// Applies the step.
    ///
    /// # Errors
    ///
    /// Returns an error if an expression fails to evaluate or a unit is
    /// unknown under the `error` policy.
    pub fn apply(&self, df: DataFrame) -> Result<DataFrame> {
        match self {
            Self::Rename(renames) => Ok(rename(df, renames)),
            Self::Calculate {
                name,
                expression,
                round,
            } => calculate(df, name, expression, *round),
            Self::Coerce(coercion) => Ok(coerce(df, coercion)),
            Self::Unit(unit) => normalize_units(df, unit),
            Self::Filter { expression, mode } => {
                let mut mask = expression.mask(&df)?;
                if *mode == FilterMode::Drop {
                    mask.iter_mut().for_each(|keep| *keep = !*keep);
                }
                Ok(df.filter(&mask))
            }
            Self::Missing(missing) => Ok(replace_missing(df, missing)),
            Self::Mask {
                column,
                pattern,
                replacement,
            } => Ok(mask_values(df, column.as_deref(), pattern.as_ref(), replacement)),
        }
    }
}

fn rename(mut df: DataFrame, renames: &IndexMap<String, String>) -> DataFrame {
    for (from, to) in renames {
        if !df.rename_column(from, to) {
            debug!(column = %from, "Rename skipped, column absent");
        }
    }
    df
}

fn calculate(mut df: DataFrame, name: &str, expression: &Expression, round: Option<u32>) -> Result<DataFrame> {
    let mut values = expression.evaluate_frame(&df)?;
    if let Some(digits) = round {
        for v in &mut values {
            if let Some(n) = v.as_f64() {
                *v = value::number(round_to(n, f64::from(digits)));
            }
        }
    }
    df.set_column(name, values);
    Ok(df)
}

fn coerce_value(v: &Value, coercion: &Coercion) -> Value {
    if v.is_null() {
        return Value::Null;
    }
    match coercion.to {
        #[allow(clippy::cast_possible_truncation)]
        CoerceTo::Integer => value::as_f64(v)
            .filter(|f| f.is_finite())
            .map_or(Value::Null, |f| Value::from(f.trunc() as i64)),
        CoerceTo::Number => value::as_f64(v).map_or(Value::Null, value::number),
        CoerceTo::String => Value::String(value::to_text(v)),
        CoerceTo::Boolean => match v {
            Value::Bool(_) => v.clone(),
            Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
            other => match value::to_text(other).trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Value::Bool(true),
                "false" | "no" | "n" | "0" => Value::Bool(false),
                _ => Value::Null,
            },
        },
        CoerceTo::Datetime => parse_datetime(&value::to_text(v), coercion.format.as_deref())
            .map_or(Value::Null, |dt| Value::String(format_manifest(&dt))),
        CoerceTo::Upper => Value::String(value::to_text(v).to_uppercase()),
        CoerceTo::Lower => Value::String(value::to_text(v).to_lowercase()),
    }
}

fn coerce(mut df: DataFrame, coercion: &Coercion) -> DataFrame {
    let mut failed = 0usize;
    let present = df.map_column(&coercion.column, |v| {
        let out = coerce_value(v, coercion);
        if out.is_null() && !v.is_null() {
            failed += 1;
        }
        out
    });
    if !present {
        debug!(column = %coercion.column, "Coercion skipped, column absent");
    } else if failed > 0 {
        warn!(
            column = %coercion.column,
            target = ?coercion.to,
            failed,
            "Values could not be coerced and were set to null"
        );
    }
    df
}

fn normalize_units(df: DataFrame, unit: &UnitNormalization) -> Result<DataFrame> {
    let Some(value_idx) = df.column_index(&unit.column) else {
        debug!(column = %unit.column, "Unit normalization skipped, column absent");
        return Ok(df);
    };
    let unit_idx = unit.unit_column.as_deref().and_then(|c| df.column_index(c));
    let (columns, mut rows) = df.into_parts();

    for row in &mut rows {
        let source = match (unit_idx, &unit.unit) {
            (Some(idx), _) if !row[idx].is_null() => value::to_text(&row[idx]),
            (_, Some(fixed)) => fixed.clone(),
            _ => continue,
        };
        let factor = if source == unit.target_unit {
            Some(1.0)
        } else {
            unit.factors.get(&source).copied()
        };
        match factor {
            Some(factor) => {
                if let Some(n) = value::as_f64(&row[value_idx]) {
                    row[value_idx] = value::number(n * factor);
                }
                if let Some(idx) = unit_idx {
                    row[idx] = Value::String(unit.target_unit.clone());
                }
            }
            None => match unit.policy {
                UnitPolicy::Keep => {}
                UnitPolicy::Null => row[value_idx] = Value::Null,
                UnitPolicy::Error => {
                    return Err(DatError::Transform {
                        step: "unit".to_string(),
                        message: format!(
                            "no factor from '{source}' to '{}' for column '{}'",
                            unit.target_unit, unit.column
                        ),
                    });
                }
            },
        }
    }
    Ok(DataFrame::from_rows(columns, rows))
}

fn is_sentinel(cell: &Value, sentinel: &Value) -> bool {
    match (cell, sentinel) {
        (Value::String(a), Value::String(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

fn replace_missing(df: DataFrame, missing: &MissingValues) -> DataFrame {
    let targets: Vec<usize> = if missing.columns.is_empty() {
        (0..df.column_count()).collect()
    } else {
        missing.columns.iter().filter_map(|c| df.column_index(c)).collect()
    };
    let (columns, mut rows) = df.into_parts();
    for row in &mut rows {
        for &idx in &targets {
            if missing.sentinels.iter().any(|s| is_sentinel(&row[idx], s)) {
                row[idx] = Value::Null;
            }
        }
    }
    DataFrame::from_rows(columns, rows)
}

fn mask_values(df: DataFrame, column: Option<&str>, pattern: Option<&Regex>, replacement: &str) -> DataFrame {
    let targets: Vec<usize> = match column {
        Some(name) => df.column_index(name).into_iter().collect(),
        None => (0..df.column_count()).collect(),
    };
    let (columns, mut rows) = df.into_parts();
    for row in &mut rows {
        for &idx in &targets {
            let masked = match (pattern, &row[idx]) {
                (_, Value::Null) => None,
                (None, _) => Some(replacement.to_string()),
                (Some(re), Value::String(text)) => Some(re.replace_all(text, NoExpand(replacement)).into_owned()),
                (Some(re), other) => {
                    let text = value::to_text(other);
                    re.is_match(&text)
                        .then(|| re.replace_all(&text, NoExpand(replacement)).into_owned())
                }
            };
            if let Some(masked) = masked {
                row[idx] = Value::String(masked);
            }
        }
    }
    DataFrame::from_rows(columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn frame() -> DataFrame {
        DataFrame::from_rows(
            vec!["value".into(), "unit".into(), "email".into()],
            vec![
                vec![json!(1500), json!("mV"), json!("alice@example.com")],
                vec![json!(2), json!("V"), json!("contact bob@example.com now")],
                vec![json!(7), json!("kV"), json!(null)],
            ],
        )
    }

    fn units(policy: UnitPolicy) -> UnitNormalization {
        UnitNormalization {
            column: "value".to_string(),
            unit: None,
            unit_column: Some("unit".to_string()),
            target_unit: "V".to_string(),
            factors: BTreeMap::from([("mV".to_string(), 0.001)]),
            policy,
        }
    }

    #[test]
    fn test_unit_normalization_keep_and_null() {
        let out = TransformStep::Unit(units(UnitPolicy::Keep)).apply(frame()).unwrap();
        assert_eq!(out.get(0, "value"), Some(&json!(1.5)));
        assert_eq!(out.get(0, "unit"), Some(&json!("V")));
        assert_eq!(out.get(2, "value"), Some(&json!(7)));
        assert_eq!(out.get(2, "unit"), Some(&json!("kV")));

        let out = TransformStep::Unit(units(UnitPolicy::Null)).apply(frame()).unwrap();
        assert_eq!(out.get(2, "value"), Some(&json!(null)));
    }

    #[test]
    fn test_unit_normalization_error_policy() {
        let err = TransformStep::Unit(units(UnitPolicy::Error)).apply(frame()).unwrap_err();
        assert_eq!(err.code(), "DAT-TRANSFORM");
        assert!(err.to_string().contains("kV"));
    }

    #[test]
    fn test_pattern_mask() {
        let mask = PiiMask {
            column: None,
            pattern: Some(r"[\w.]+@[\w.]+".to_string()),
            replacement: "<email>".to_string(),
        };
        let out = TransformStep::mask(&mask).unwrap().apply(frame()).unwrap();
        assert_eq!(out.get(0, "email"), Some(&json!("<email>")));
        assert_eq!(out.get(1, "email"), Some(&json!("contact <email> now")));
        assert_eq!(out.get(2, "email"), Some(&json!(null)));
        assert_eq!(out.get(0, "unit"), Some(&json!("mV")));
    }

    #[test]
    fn test_coercions() {
        let df = DataFrame::from_rows(
            vec!["x".into()],
            vec![vec![json!("3.9")], vec![json!("nope")], vec![json!("2024-03-01")]],
        );
        let int = Coercion {
            column: "x".to_string(),
            to: CoerceTo::Integer,
            format: None,
        };
        let out = TransformStep::Coerce(int).apply(df.clone()).unwrap();
        assert_eq!(out.column_values("x").unwrap(), vec![&json!(3), &json!(null), &json!(null)]);

        let dt = Coercion {
            column: "x".to_string(),
            to: CoerceTo::Datetime,
            format: None,
        };
        let out = TransformStep::Coerce(dt).apply(df).unwrap();
        assert_eq!(out.get(2, "x"), Some(&json!("2024-03-01T00:00:00Z")));
        assert_eq!(out.get(1, "x"), Some(&json!(null)));
    }

    #[test]
    fn test_drop_filter() {
        let step = TransformStep::filter(&RowFilter {
            expression: "value > 5".to_string(),
            mode: FilterMode::Drop,
        })
        .unwrap();
        let out = step.apply(frame()).unwrap();
        assert_eq!(out.row_count(), 1);
        assert_eq!(out.get(0, "value"), Some(&json!(2)));
    }
}
