//! The closed set of table extraction strategies.
//!
//! Each strategy reads a JSONPath-addressed subtree of a document and
//! produces a table. [`Extraction`] is the tagged profile representation;
//! [`Strategy`] is implemented once per variant and dispatched through
//! [`Extraction::strategy`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{DatError, Result};
use crate::frame::{unique_columns, value, DataFrame, JoinKind};
use crate::profile::JsonPath;

/// Variables visible to an extraction: ambient context plus loop variables.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: Map<String, Value>,
}

impl Scope {
    /// Creates a scope from resolved context values.
    #[must_use]
    pub fn new(vars: Map<String, Value>) -> Self {
        Self { vars }
    }

    /// Returns a child scope with an extra variable.
    #[must_use]
    pub fn with_var(&self, name: &str, value: Value) -> Self {
        let mut vars = self.vars.clone();
        vars.insert(name.to_string(), value);
        Self { vars }
    }

    /// Returns the visible variables.
    #[must_use]
    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }
}

/// A table extraction algorithm.
pub trait Strategy {
    /// Strategy kind, as written in profiles.
    fn kind(&self) -> &'static str;

    /// Extracts a table from `document`.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Extraction`] if the addressed subtree has the
    /// wrong shape.
    fn extract(&self, document: &Value, scope: &Scope) -> Result<DataFrame>;

    /// Appends configuration problems (bad paths, missing keys).
    fn check(&self, errors: &mut Vec<String>);

    /// Columns the strategy is known to produce, when fixed by config.
    fn declared_columns(&self) -> Option<Vec<String>> {
        None
    }
}

fn root_path() -> String {
    "$".to_string()
}

fn default_separator() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

fn default_var_name() -> String {
    "variable".to_string()
}

fn default_value_name() -> String {
    "value".to_string()
}

/// A single object becomes one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatObject {
    /// Path to the object; several matches yield several rows.
    #[serde(default = "root_path")]
    pub path: String,
    /// Flatten nested objects into `parent<sep>child` columns.
    #[serde(default = "default_true")]
    pub flatten: bool,
    /// Key separator for flattening.
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Column allow-list, in output order.
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Orientation of a two-dimensional array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Each inner array is a row; headers come first.
    #[default]
    Rows,
    /// Each inner array is a column; its first cell is the header.
    Columns,
}

/// A two-dimensional array becomes N data rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadersData {
    /// Path to the 2D array.
    pub path: String,
    /// Path to a separate header array.
    #[serde(default)]
    pub headers_path: Option<String>,
    /// Explicit headers; when set, every inner array is data.
    #[serde(default)]
    pub headers: Option<Vec<String>>,
    /// Array orientation.
    #[serde(default)]
    pub orientation: Orientation,
}

/// An array of objects becomes one row per element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayOfObjects {
    /// Path to the array (or to the objects themselves via `[*]`).
    pub path: String,
    /// Column allow-list, in output order.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Flatten nested objects.
    #[serde(default)]
    pub flatten: bool,
    /// Key separator for flattening.
    #[serde(default = "default_separator")]
    pub separator: String,
}

/// Iterates an array, running a nested extraction per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatOver {
    /// Path to the array.
    pub path: String,
    /// Column holding the 0-based iteration index.
    #[serde(default)]
    pub index_var: Option<String>,
    /// Loop variables: column name to a path relative to the element.
    #[serde(default)]
    pub variables: IndexMap<String, String>,
    /// Extraction run against each element (one flat row when absent).
    #[serde(default)]
    pub inner: Option<Box<Extraction>>,
    /// Add the ambient context values as columns.
    #[serde(default)]
    pub include_context: bool,
}

/// Wide-to-long reshape of another extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unpivot {
    /// The wide table.
    pub source: Box<Extraction>,
    /// Columns kept on every row.
    #[serde(default)]
    pub id_vars: Vec<String>,
    /// Columns melted; every non-id column when empty.
    #[serde(default)]
    pub value_vars: Vec<String>,
    /// Column receiving the melted column name.
    #[serde(default = "default_var_name")]
    pub var_name: String,
    /// Column receiving the melted value.
    #[serde(default = "default_value_name")]
    pub value_name: String,
}

/// Two extractions combined on a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    /// Left side.
    pub left: Box<Extraction>,
    /// Right side.
    pub right: Box<Extraction>,
    /// Key columns present on both sides.
    pub on: Vec<String>,
    /// Join kind.
    #[serde(default)]
    pub how: JoinKind,
}

/// A table's extraction strategy and its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Extraction {
    /// See [`FlatObject`].
    FlatObject(FlatObject),
    /// See [`HeadersData`].
    HeadersData(HeadersData),
    /// See [`ArrayOfObjects`].
    ArrayOfObjects(ArrayOfObjects),
    /// See [`RepeatOver`].
    RepeatOver(RepeatOver),
    /// See [`Unpivot`].
    Unpivot(Unpivot),
    /// See [`Join`].
    Join(Join),
}

impl Extraction {
    /// Returns the strategy implementation for this variant.
    #[must_use]
    pub fn strategy(&self) -> &dyn Strategy {
        match self {
            Self::FlatObject(s) => s,
            Self::HeadersData(s) => s,
            Self::ArrayOfObjects(s) => s,
            Self::RepeatOver(s) => s,
            Self::Unpivot(s) => s,
            Self::Join(s) => s,
        }
    }

    /// Extracts a table with the variant's strategy.
    ///
    /// # Errors
    ///
    /// See [`Strategy::extract`].
    pub fn extract(&self, document: &Value, scope: &Scope) -> Result<DataFrame> {
        self.strategy().extract(document, scope)
    }
}

fn fail(strategy: &str, message: impl Into<String>) -> DatError {
    DatError::Extraction {
        strategy: strategy.to_string(),
        message: message.into(),
    }
}

fn compile(strategy: &str, path: &str) -> Result<JsonPath> {
    JsonPath::parse(path).map_err(|e| fail(strategy, e.to_string()))
}

fn check_path(path: &str, errors: &mut Vec<String>) {
    if let Err(e) = JsonPath::parse(path) {
        errors.push(e.to_string());
    }
}

/// Flattens nested objects into `parent<sep>child` keys. Arrays stay intact.
fn flatten_object(object: &Map<String, Value>, separator: &str) -> Map<String, Value> {
    fn walk(prefix: &str, value: &Value, separator: &str, out: &mut Map<String, Value>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (k, v) in map {
                    walk(&format!("{prefix}{separator}{k}"), v, separator, out);
                }
            }
            other => {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }
    let mut out = Map::new();
    for (k, v) in object {
        walk(k, v, separator, &mut out);
    }
    out
}

fn fields_filter(fields: &[String]) -> Option<&[String]> {
    (!fields.is_empty()).then_some(fields)
}

impl Strategy for FlatObject {
    fn kind(&self) -> &'static str {
        "flat_object"
    }

    fn extract(&self, document: &Value, _scope: &Scope) -> Result<DataFrame> {
        let path = compile(self.kind(), &self.path)?;
        let mut records = Vec::new();
        for found in path.select(document) {
            match found {
                Value::Object(map) if self.flatten => {
                    records.push(Value::Object(flatten_object(map, &self.separator)));
                }
                Value::Object(_) => records.push(found.clone()),
                Value::Null => {}
                other => {
                    return Err(fail(
                        self.kind(),
                        format!("'{}' addresses a {} instead of an object", self.path, type_name(other)),
                    ));
                }
            }
        }
        Ok(DataFrame::from_records(&records, fields_filter(&self.fields)))
    }

    fn check(&self, errors: &mut Vec<String>) {
        check_path(&self.path, errors);
    }

    fn declared_columns(&self) -> Option<Vec<String>> {
        fields_filter(&self.fields).map(<[String]>::to_vec)
    }
}

fn header_names(cells: &[Value]) -> Vec<String> {
    cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let name = value::to_text(cell).trim().to_string();
            if name.is_empty() {
                format!("column_{}", i + 1)
            } else {
                name
            }
        })
        .collect()
}

fn transpose(columns: &[Vec<Value>]) -> Vec<Vec<Value>> {
    let height = columns.iter().map(Vec::len).max().unwrap_or(0);
    (0..height)
        .map(|r| {
            columns
                .iter()
                .map(|col| col.get(r).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect()
}

impl Strategy for HeadersData {
    fn kind(&self) -> &'static str {
        "headers_data"
    }

    fn extract(&self, document: &Value, _scope: &Scope) -> Result<DataFrame> {
        let path = compile(self.kind(), &self.path)?;
        let Some(found) = path.select_one(document) else {
            return Ok(DataFrame::default());
        };
        let Value::Array(outer) = found else {
            return Err(fail(self.kind(), format!("'{}' is not an array", self.path)));
        };
        let inner: Vec<Vec<Value>> = outer
            .iter()
            .map(|item| match item {
                Value::Array(cells) => Ok(cells.clone()),
                other => Err(fail(
                    self.kind(),
                    format!("'{}' holds a {} instead of an array", self.path, type_name(other)),
                )),
            })
            .collect::<Result<_>>()?;

        let mut grid = match self.orientation {
            Orientation::Rows => inner,
            Orientation::Columns => transpose(&inner),
        };

        let headers = if let Some(explicit) = &self.headers {
            explicit.clone()
        } else if let Some(headers_path) = &self.headers_path {
            match compile(self.kind(), headers_path)?.select_one(document) {
                Some(Value::Array(cells)) => header_names(cells),
                _ => return Err(fail(self.kind(), format!("'{headers_path}' is not a header array"))),
            }
        } else if grid.is_empty() {
            Vec::new()
        } else {
            header_names(&grid.remove(0))
        };
        Ok(DataFrame::from_rows(unique_columns(headers), grid))
    }

    fn check(&self, errors: &mut Vec<String>) {
        check_path(&self.path, errors);
        if let Some(headers_path) = &self.headers_path {
            check_path(headers_path, errors);
        }
    }

    fn declared_columns(&self) -> Option<Vec<String>> {
        self.headers.clone().map(unique_columns)
    }
}

impl Strategy for ArrayOfObjects {
    fn kind(&self) -> &'static str {
        "array_of_objects"
    }

    fn extract(&self, document: &Value, _scope: &Scope) -> Result<DataFrame> {
        let path = compile(self.kind(), &self.path)?;
        let mut records = Vec::new();
        for found in path.select(document) {
            match found {
                Value::Array(items) => records.extend(items.iter().cloned()),
                Value::Null => {}
                other => records.push(other.clone()),
            }
        }
        if self.flatten {
            for record in &mut records {
                if let Value::Object(map) = record {
                    *map = flatten_object(map, &self.separator);
                }
            }
        }
        Ok(DataFrame::from_records(&records, fields_filter(&self.fields)))
    }

    fn check(&self, errors: &mut Vec<String>) {
        check_path(&self.path, errors);
    }

    fn declared_columns(&self) -> Option<Vec<String>> {
        fields_filter(&self.fields).map(<[String]>::to_vec)
    }
}

impl RepeatOver {
    fn iteration_frame(&self, item: &Value, index: usize, scope: &Scope) -> Result<DataFrame> {
        let mut loop_vars: Vec<(String, Value)> = Vec::new();
        if let Some(name) = &self.index_var {
            loop_vars.push((name.clone(), Value::from(index)));
        }
        for (name, rel) in &self.variables {
            let found = compile(self.kind(), rel)?
                .select_one(item)
                .cloned()
                .unwrap_or(Value::Null);
            loop_vars.push((name.clone(), found));
        }

        let mut child = scope.clone();
        for (name, v) in &loop_vars {
            child = child.with_var(name, v.clone());
        }

        let mut inner_df = match &self.inner {
            Some(inner) => inner.extract(item, &child)?,
            None => match item {
                Value::Object(map) => DataFrame::from_records(&[Value::Object(flatten_object(map, "."))], None),
                other => DataFrame::from_records(std::slice::from_ref(other), None),
            },
        };
        if inner_df.is_empty() && self.inner.is_none() {
            inner_df.push_row(Vec::new());
        }

        let mut df = prepend_columns(inner_df, &loop_vars);
        let rows = df.row_count();
        if self.include_context {
            for (name, v) in scope.vars() {
                if !df.has_column(name) {
                    df.set_column(name, vec![v.clone(); rows]);
                }
            }
        }
        Ok(df)
    }
}

/// Puts constant columns in front of a table, replacing same-named ones.
fn prepend_columns(df: DataFrame, constants: &[(String, Value)]) -> DataFrame {
    let (columns, rows) = df.into_parts();
    let keep: Vec<usize> = (0..columns.len())
        .filter(|&i| !constants.iter().any(|(name, _)| *name == columns[i]))
        .collect();
    let mut out_columns: Vec<String> = constants.iter().map(|(name, _)| name.clone()).collect();
    out_columns.extend(keep.iter().map(|&i| columns[i].clone()));
    let out_rows = rows
        .into_iter()
        .map(|row| {
            let mut out: Vec<Value> = constants.iter().map(|(_, v)| v.clone()).collect();
            out.extend(keep.iter().map(|&i| row[i].clone()));
            out
        })
        .collect();
    DataFrame::from_rows(out_columns, out_rows)
}

impl Strategy for RepeatOver {
    fn kind(&self) -> &'static str {
        "repeat_over"
    }

    fn extract(&self, document: &Value, scope: &Scope) -> Result<DataFrame> {
        let path = compile(self.kind(), &self.path)?;
        let items: Vec<&Value> = match path.select_one(document) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().collect(),
            Some(other) => {
                return Err(fail(
                    self.kind(),
                    format!("'{}' addresses a {} instead of an array", self.path, type_name(other)),
                ));
            }
        };
        let frames = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| self.iteration_frame(item, i, scope))
            .collect::<Result<Vec<_>>>()?;
        Ok(DataFrame::concat(&frames))
    }

    fn check(&self, errors: &mut Vec<String>) {
        check_path(&self.path, errors);
        for rel in self.variables.values() {
            check_path(rel, errors);
        }
        if let Some(inner) = &self.inner {
            inner.strategy().check(errors);
        }
    }
}

impl Strategy for Unpivot {
    fn kind(&self) -> &'static str {
        "unpivot"
    }

    fn extract(&self, document: &Value, scope: &Scope) -> Result<DataFrame> {
        let wide = self.source.extract(document, scope)?;
        let value_vars: Vec<String> = if self.value_vars.is_empty() {
            wide.columns()
                .iter()
                .filter(|c| !self.id_vars.contains(c))
                .cloned()
                .collect()
        } else {
            self.value_vars.clone()
        };
        Ok(wide.melt(&self.id_vars, &value_vars, &self.var_name, &self.value_name))
    }

    fn check(&self, errors: &mut Vec<String>) {
        self.source.strategy().check(errors);
        if self.var_name == self.value_name {
            errors.push("unpivot: var_name and value_name must differ".to_string());
        }
    }

    fn declared_columns(&self) -> Option<Vec<String>> {
        let mut columns = self.id_vars.clone();
        columns.push(self.var_name.clone());
        columns.push(self.value_name.clone());
        Some(columns)
    }
}

impl Strategy for Join {
    fn kind(&self) -> &'static str {
        "join"
    }

    fn extract(&self, document: &Value, scope: &Scope) -> Result<DataFrame> {
        let left = self.left.extract(document, scope)?;
        let right = self.right.extract(document, scope)?;
        for key in &self.on {
            for (side, frame) in [("left", &left), ("right", &right)] {
                if !frame.has_column(key) && !frame.columns().is_empty() {
                    return Err(fail(self.kind(), format!("{side} side has no key column '{key}'")));
                }
            }
        }
        Ok(DataFrame::join(&left, &right, &self.on, self.how))
    }

    fn check(&self, errors: &mut Vec<String>) {
        self.left.strategy().check(errors);
        self.right.strategy().check(errors);
        if self.on.is_empty() {
            errors.push("join: 'on' must name at least one key column".to_string());
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(config: Value) -> Extraction {
        serde_json::from_value(config).unwrap()
    }

    fn doc() -> Value {
        json!({
            "header": {"lot": "L1", "tool": {"id": "T7", "bay": 3}},
            "grid": [["site", "x", "y"], [1, 0.5, 0.25], [2, 0.75, 0.5], [3, 1.0, 0.125]],
            "wafers": [
                {"wafer": "W1", "sites": [{"site": 1, "v": 10}, {"site": 2, "v": 11}]},
                {"wafer": "W2", "sites": [{"site": 1, "v": 12}]}
            ],
            "limits": [{"site": 1, "max": 11}, {"site": 3, "max": 9}]
        })
    }

    #[test]
    fn test_flat_object_flattens() {
        let ex = parse(json!({"strategy": "flat_object", "path": "$.header"}));
        let df = ex.extract(&doc(), &Scope::default()).unwrap();
        assert_eq!(df.columns(), &["lot", "tool.id", "tool.bay"]);
        assert_eq!(df.row_count(), 1);
        assert_eq!(df.get(0, "tool.bay"), Some(&json!(3)));
    }

    #[test]
    fn test_headers_data_shape() {
        let ex = parse(json!({"strategy": "headers_data", "path": "$.grid"}));
        let df = ex.extract(&doc(), &Scope::default()).unwrap();
        assert_eq!(df.columns(), &["site", "x", "y"]);
        assert_eq!(df.row_count(), 3);
        assert_eq!(df.get(2, "y"), Some(&json!(0.125)));
    }

    #[test]
    fn test_headers_data_columns_orientation_and_explicit_headers() {
        let document = json!({"cols": [["a", 1, 2], ["b", 3, 4]]});
        let ex = parse(json!({"strategy": "headers_data", "path": "$.cols", "orientation": "columns"}));
        let df = ex.extract(&document, &Scope::default()).unwrap();
        assert_eq!(df.columns(), &["a", "b"]);
        assert_eq!(df.rows(), &[vec![json!(1), json!(3)], vec![json!(2), json!(4)]]);

        let ex = parse(json!({"strategy": "headers_data", "path": "$.cols", "headers": ["p", "q", "r"]}));
        let df = ex.extract(&document, &Scope::default()).unwrap();
        assert_eq!(df.row_count(), 2);
        assert_eq!(df.column_count(), 3);
    }

    #[test]
    fn test_headers_data_repeated_headers_survive_records() {
        let document = json!({"grid": [["site", "value", "value"], [1, 2.5, 3.5]]});
        let ex = parse(json!({"strategy": "headers_data", "path": "$.grid"}));
        let df = ex.extract(&document, &Scope::default()).unwrap();
        assert_eq!(df.columns(), &["site", "value", "value_2"]);
        assert_eq!(df.to_records(), vec![json!({"site": 1, "value": 2.5, "value_2": 3.5})]);
    }

    #[test]
    fn test_array_of_objects_field_allow_list() {
        let ex = parse(json!({"strategy": "array_of_objects", "path": "$.wafers[0].sites", "fields": ["v"]}));
        let df = ex.extract(&doc(), &Scope::default()).unwrap();
        assert_eq!(df.columns(), &["v"]);
        assert_eq!(df.row_count(), 2);
    }

    #[test]
    fn test_repeat_over_injects_loop_variables() {
        let ex = parse(json!({
            "strategy": "repeat_over",
            "path": "$.wafers",
            "index_var": "idx",
            "variables": {"wafer": "$.wafer"},
            "inner": {"strategy": "array_of_objects", "path": "$.sites"},
            "include_context": true
        }));
        let scope = Scope::new(json!({"lot": "L1"}).as_object().unwrap().clone());
        let df = ex.extract(&doc(), &scope).unwrap();
        assert_eq!(df.columns(), &["idx", "wafer", "site", "v", "lot"]);
        assert_eq!(df.row_count(), 3);
        assert_eq!(df.get(2, "wafer"), Some(&json!("W2")));
        assert_eq!(df.get(2, "idx"), Some(&json!(1)));
        assert_eq!(df.get(0, "lot"), Some(&json!("L1")));
    }

    #[test]
    fn test_unpivot_and_join() {
        let ex = parse(json!({
            "strategy": "unpivot",
            "source": {"strategy": "headers_data", "path": "$.grid"},
            "id_vars": ["site"],
            "var_name": "axis"
        }));
        let df = ex.extract(&doc(), &Scope::default()).unwrap();
        assert_eq!(df.columns(), &["site", "axis", "value"]);
        assert_eq!(df.row_count(), 6);

        let ex = parse(json!({
            "strategy": "join",
            "left": {"strategy": "headers_data", "path": "$.grid"},
            "right": {"strategy": "array_of_objects", "path": "$.limits"},
            "on": ["site"],
            "how": "left"
        }));
        let df = ex.extract(&doc(), &Scope::default()).unwrap();
        assert_eq!(df.row_count(), 3);
        assert_eq!(df.get(0, "max"), Some(&json!(11)));
        assert_eq!(df.get(1, "max"), Some(&json!(null)));
    }

    #[test]
    fn test_wrong_shape_is_an_extraction_error() {
        let ex = parse(json!({"strategy": "headers_data", "path": "$.header"}));
        let err = ex.extract(&doc(), &Scope::default()).unwrap_err();
        assert_eq!(err.code(), "DAT-EXTRACTION");

        let mut errors = Vec::new();
        parse(json!({"strategy": "join", "left": {"strategy": "flat_object", "path": "$.["}, "right": {"strategy": "flat_object"}, "on": []}))
            .strategy()
            .check(&mut errors);
        assert_eq!(errors.len(), 2);
    }
}
