//! In-memory tabular data.
//!
//! A [`DataFrame`] is an ordered list of column names and row-major cells,
//! where each cell is a JSON value. It is the common currency between the
//! adapters, extraction strategies, validation, transforms and outputs.

pub mod arrow;
pub mod value;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// How two tables are combined on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Only rows with a match on both sides.
    #[default]
    Inner,
    /// All left rows, matched right rows.
    Left,
    /// All right rows, matched left rows.
    Right,
    /// All rows from both sides.
    Outer,
}

/// Reducer applied per group by [`DataFrame::group_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    /// Sum of numeric values.
    Sum,
    /// Mean of numeric values.
    Mean,
    /// Minimum numeric value.
    Min,
    /// Maximum numeric value.
    Max,
    /// Number of non-null values.
    Count,
    /// Number of distinct non-null values.
    CountDistinct,
    /// First value in the group.
    First,
    /// Last value in the group.
    Last,
}

impl Reducer {
    /// Returns the snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::CountDistinct => "count_distinct",
            Self::First => "first",
            Self::Last => "last",
        }
    }

    /// Applies the reducer to a group's values.
    #[must_use]
    pub fn apply(&self, values: &[&Value]) -> Value {
        let numbers = || values.iter().filter_map(|v| value::as_f64(v));
        match self {
            Self::Sum => value::number(numbers().sum()),
            Self::Mean => {
                let nums: Vec<f64> = numbers().collect();
                if nums.is_empty() {
                    Value::Null
                } else {
                    #[allow(clippy::cast_precision_loss)]
                    let mean = nums.iter().sum::<f64>() / nums.len() as f64;
                    value::number(mean)
                }
            }
            Self::Min => numbers().reduce(f64::min).map_or(Value::Null, value::number),
            Self::Max => numbers().reduce(f64::max).map_or(Value::Null, value::number),
            Self::Count => Value::from(values.iter().filter(|v| !v.is_null()).count()),
            Self::CountDistinct => {
                let distinct: HashSet<String> = values
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| value::key_text(v))
                    .collect();
                Value::from(distinct.len())
            }
            Self::First => values.first().map_or(Value::Null, |v| (*v).clone()),
            Self::Last => values.last().map_or(Value::Null, |v| (*v).clone()),
        }
    }
}

/// Makes column names unique by suffixing repeats with `_2`, `_3`, ...
///
/// Records are keyed by column name, so a repeated header would otherwise
/// collapse into one field on export.
#[must_use]
pub fn unique_columns(names: Vec<String>) -> Vec<String> {
    let mut taken: HashSet<String> = names.iter().cloned().collect();
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            if seen.insert(name.clone()) {
                return name;
            }
            let mut n = 2;
            loop {
                let candidate = format!("{name}_{n}");
                if taken.insert(candidate.clone()) {
                    seen.insert(candidate.clone());
                    return candidate;
                }
                n += 1;
            }
        })
        .collect()
}

/// Row-major table of JSON cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl DataFrame {
    /// Creates an empty table with the given columns.
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Creates a table from rows, padding short rows with null and
    /// truncating long ones.
    #[must_use]
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Value::Null);
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Builds a table from JSON objects.
    ///
    /// Columns appear in first-seen order; `fields` restricts and orders them.
    /// Non-object records become a single `value` column.
    #[must_use]
    pub fn from_records(records: &[Value], fields: Option<&[String]>) -> Self {
        let columns: Vec<String> = match fields {
            Some(fields) => fields.to_vec(),
            None => {
                let mut seen: IndexMap<String, ()> = IndexMap::new();
                for record in records {
                    match record {
                        Value::Object(map) => {
                            for key in map.keys() {
                                seen.entry(key.clone()).or_insert(());
                            }
                        }
                        _ => {
                            seen.entry("value".to_string()).or_insert(());
                        }
                    }
                }
                seen.into_keys().collect()
            }
        };

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|col| match record {
                        Value::Object(map) => map.get(col).cloned().unwrap_or(Value::Null),
                        other if col == "value" => other.clone(),
                        _ => Value::Null,
                    })
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    /// Returns the column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the rows.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Consumes the table, returning its parts.
    #[must_use]
    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.columns, self.rows)
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the position of a column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Returns true if the column exists.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Returns a column's values, or `None` if the column does not exist.
    #[must_use]
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Returns a single cell.
    #[must_use]
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Returns one row as a column-name keyed map.
    #[must_use]
    pub fn row_map(&self, row: usize) -> HashMap<&str, &Value> {
        self.rows.get(row).map_or_else(HashMap::new, |r| {
            self.columns
                .iter()
                .map(String::as_str)
                .zip(r.iter())
                .collect()
        })
    }

    /// Appends a row, padding or truncating to the table width.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    /// Sets a column's values, appending the column if it does not exist.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) {
        let idx = if let Some(idx) = self.column_index(name) {
            idx
        } else {
            self.columns.push(name.to_string());
            for row in &mut self.rows {
                row.push(Value::Null);
            }
            self.columns.len() - 1
        };
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[idx] = value;
        }
    }

    /// Applies `f` to every cell of a column. Returns false if the column is absent.
    pub fn map_column<F>(&mut self, name: &str, mut f: F) -> bool
    where
        F: FnMut(&Value) -> Value,
    {
        let Some(idx) = self.column_index(name) else {
            return false;
        };
        for row in &mut self.rows {
            row[idx] = f(&row[idx]);
        }
        true
    }

    /// Renames a column. Returns false if `from` is absent.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.column_index(from) {
            Some(idx) => {
                self.columns[idx] = to.to_string();
                true
            }
            None => false,
        }
    }

    /// Returns a table with exactly `columns`, in that order.
    ///
    /// Missing columns are filled with null; columns not listed are dropped.
    #[must_use]
    pub fn reindex(&self, columns: &[String]) -> Self {
        let positions: Vec<Option<usize>> = columns.iter().map(|c| self.column_index(c)).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                positions
                    .iter()
                    .map(|pos| pos.map_or(Value::Null, |i| row[i].clone()))
                    .collect()
            })
            .collect();
        Self {
            columns: columns.to_vec(),
            rows,
        }
    }

    /// Keeps rows whose mask entry is true.
    #[must_use]
    pub fn filter(&self, mask: &[bool]) -> Self {
        self.partition(mask).0
    }

    /// Splits rows into (mask true, mask false). Row counts always sum to the
    /// original; rows beyond the mask length count as failing.
    #[must_use]
    pub fn partition(&self, mask: &[bool]) -> (Self, Self) {
        let mut pass = Self::new(self.columns.clone());
        let mut fail = Self::new(self.columns.clone());
        for (i, row) in self.rows.iter().enumerate() {
            if mask.get(i).copied().unwrap_or(false) {
                pass.rows.push(row.clone());
            } else {
                fail.rows.push(row.clone());
            }
        }
        (pass, fail)
    }

    /// Returns the first `n` rows.
    #[must_use]
    pub fn head(&self, n: usize) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Truncates to at most `n` rows, returning how many were dropped.
    pub fn truncate(&mut self, n: usize) -> usize {
        let dropped = self.rows.len().saturating_sub(n);
        self.rows.truncate(n);
        dropped
    }

    /// Concatenates tables; columns are the union in first-seen order.
    #[must_use]
    pub fn concat(frames: &[Self]) -> Self {
        let mut columns: IndexMap<String, ()> = IndexMap::new();
        for frame in frames {
            for col in &frame.columns {
                columns.entry(col.clone()).or_insert(());
            }
        }
        let columns: Vec<String> = columns.into_keys().collect();
        let mut out = Self::new(columns.clone());
        for frame in frames {
            out.rows.extend(frame.reindex(&columns).rows);
        }
        out
    }

    /// Joins two tables on key columns.
    ///
    /// Output columns are the left columns followed by the right's non-key
    /// columns; a right column clashing with a left one gets a `_right` suffix.
    #[must_use]
    pub fn join(left: &Self, right: &Self, on: &[String], how: JoinKind) -> Self {
        let key_of = |frame: &Self, row: &[Value]| -> String {
            on.iter()
                .map(|k| {
                    frame
                        .column_index(k)
                        .map_or_else(|| "null".to_string(), |i| value::key_text(&row[i]))
                })
                .collect::<Vec<_>>()
                .join("\u{1f}")
        };

        let right_extra: Vec<(usize, String)> = right
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !on.contains(c))
            .map(|(i, c)| {
                let name = if left.has_column(c) {
                    format!("{c}_right")
                } else {
                    c.clone()
                };
                (i, name)
            })
            .collect();

        let mut columns = left.columns.clone();
        let missing_keys: Vec<&String> = on.iter().filter(|k| !left.has_column(k)).collect();
        columns.extend(missing_keys.iter().map(|k| (*k).clone()));
        columns.extend(right_extra.iter().map(|(_, name)| name.clone()));
        let mut out = Self::new(columns);

        let combine = |l: Option<&Vec<Value>>, r: Option<&Vec<Value>>| -> Vec<Value> {
            let mut row: Vec<Value> = match l {
                Some(l) => l.clone(),
                None => left
                    .columns
                    .iter()
                    .map(|c| match (on.contains(c), r, right.column_index(c)) {
                        (true, Some(r), Some(i)) => r[i].clone(),
                        _ => Value::Null,
                    })
                    .collect(),
            };
            for key in &missing_keys {
                let v = r
                    .and_then(|r| right.column_index(key).map(|i| r[i].clone()))
                    .unwrap_or(Value::Null);
                row.push(v);
            }
            for (i, _) in &right_extra {
                row.push(r.map_or(Value::Null, |r| r[*i].clone()));
            }
            row
        };

        let mut right_index: IndexMap<String, Vec<usize>> = IndexMap::new();
        for (i, row) in right.rows.iter().enumerate() {
            right_index.entry(key_of(right, row)).or_default().push(i);
        }

        match how {
            JoinKind::Right => {
                let mut left_index: IndexMap<String, Vec<usize>> = IndexMap::new();
                for (i, row) in left.rows.iter().enumerate() {
                    left_index.entry(key_of(left, row)).or_default().push(i);
                }
                for r in &right.rows {
                    match left_index.get(&key_of(right, r)) {
                        Some(matches) => {
                            for &li in matches {
                                out.rows.push(combine(Some(&left.rows[li]), Some(r)));
                            }
                        }
                        None => out.rows.push(combine(None, Some(r))),
                    }
                }
            }
            JoinKind::Inner | JoinKind::Left | JoinKind::Outer => {
                let mut matched_right: HashSet<usize> = HashSet::new();
                for l in &left.rows {
                    match right_index.get(&key_of(left, l)) {
                        Some(matches) => {
                            for &ri in matches {
                                matched_right.insert(ri);
                                out.rows.push(combine(Some(l), Some(&right.rows[ri])));
                            }
                        }
                        None if how != JoinKind::Inner => out.rows.push(combine(Some(l), None)),
                        None => {}
                    }
                }
                if how == JoinKind::Outer {
                    for (ri, r) in right.rows.iter().enumerate() {
                        if !matched_right.contains(&ri) {
                            out.rows.push(combine(None, Some(r)));
                        }
                    }
                }
            }
        }
        out
    }

    /// Reshapes wide to long.
    ///
    /// `id_vars` are kept on every output row; each of `value_vars` becomes a
    /// row with its name under `var_name` and its value under `value_name`.
    #[must_use]
    pub fn melt(&self, id_vars: &[String], value_vars: &[String], var_name: &str, value_name: &str) -> Self {
        let mut columns = id_vars.to_vec();
        columns.push(var_name.to_string());
        columns.push(value_name.to_string());
        let mut out = Self::new(columns);

        let id_idx: Vec<Option<usize>> = id_vars.iter().map(|c| self.column_index(c)).collect();
        for row in &self.rows {
            for var in value_vars {
                let mut new_row: Vec<Value> = id_idx
                    .iter()
                    .map(|i| i.map_or(Value::Null, |i| row[i].clone()))
                    .collect();
                new_row.push(Value::String(var.clone()));
                new_row.push(
                    self.column_index(var)
                        .map_or(Value::Null, |i| row[i].clone()),
                );
                out.rows.push(new_row);
            }
        }
        out
    }

    /// Groups by key columns and reduces columns.
    ///
    /// Each reducer is `(source column, reducer, output column)`. Groups
    /// appear in first-seen order.
    #[must_use]
    pub fn group_by(&self, keys: &[String], reducers: &[(String, Reducer, String)]) -> Self {
        let key_idx: Vec<Option<usize>> = keys.iter().map(|k| self.column_index(k)).collect();
        let mut groups: IndexMap<String, (Vec<Value>, Vec<usize>)> = IndexMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            let key_values: Vec<Value> = key_idx
                .iter()
                .map(|idx| idx.map_or(Value::Null, |j| row[j].clone()))
                .collect();
            let key = key_values
                .iter()
                .map(value::key_text)
                .collect::<Vec<_>>()
                .join("\u{1f}");
            groups
                .entry(key)
                .or_insert_with(|| (key_values, Vec::new()))
                .1
                .push(i);
        }

        let mut columns = keys.to_vec();
        columns.extend(reducers.iter().map(|(_, _, out)| out.clone()));
        let mut out = Self::new(columns);
        for (_, (key_values, members)) in groups {
            let mut row = key_values;
            for (source, reducer, _) in reducers {
                let values: Vec<&Value> = match self.column_index(source) {
                    Some(idx) => members.iter().map(|&m| &self.rows[m][idx]).collect(),
                    None => Vec::new(),
                };
                row.push(reducer.apply(&values));
            }
            out.rows.push(row);
        }
        out
    }

    /// Converts rows to JSON objects keyed by column name.
    #[must_use]
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let map: serde_json::Map<String, Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(map)
            })
            .collect()
    }
}
