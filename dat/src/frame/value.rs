//! Helpers for treating JSON values as table cells.

use serde_json::Value;

/// Reads a cell as a float: numbers directly, numeric strings parsed.
#[must_use]
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Renders a cell as display text (`null` becomes the empty string).
#[must_use]
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds a number cell, preferring an integer representation when exact.
#[must_use]
pub fn number(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.007_199_254_740_992e15 {
        #[allow(clippy::cast_possible_truncation)]
        return Value::from(value as i64);
    }
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Returns true for JSON null.
#[must_use]
pub fn is_null(value: &Value) -> bool {
    value.is_null()
}

/// A total-order key for grouping and joining cells.
#[must_use]
pub fn key_text(value: &Value) -> String {
    match value {
        Value::String(s) => format!("s:{s}"),
        Value::Number(n) => n
            .as_f64()
            .map_or_else(|| format!("n:{n}"), |f| format!("n:{f}")),
        other => other.to_string(),
    }
}

/// Parses raw text from a delimited file into a typed cell.
///
/// Empty text becomes null; integers, floats and booleans are recognized.
#[must_use]
pub fn infer_text(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return serde_json::Number::from_f64(f).map_or_else(|| Value::String(text.to_string()), Value::Number);
        }
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(text.to_string()),
    }
}
