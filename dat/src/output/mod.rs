//! Output building: combining extracted tables into named outputs.

use indexmap::IndexMap;
use tracing::debug;

use crate::errors::{DatError, Result};
use crate::extract::ExtractedTable;
use crate::frame::DataFrame;
use crate::ids::sanitize_component;
use crate::profile::{OutputDef, Profile};
use crate::utils::{format_compact, Timestamp};

/// Template used when an output declares no file name.
pub const DEFAULT_FILE_NAME: &str = "{output}";

const TOKENS: [&str; 6] = ["output", "profile", "profile_id", "version", "timestamp", "text"];

/// Values substituted into a file name template.
#[derive(Debug, Clone)]
pub struct FileNameVars<'a> {
    /// Output name.
    pub output: &'a str,
    /// Profile name.
    pub profile: &'a str,
    /// Profile content hash.
    pub profile_id: &'a str,
    /// Profile version.
    pub version: u32,
    /// Export time.
    pub timestamp: Timestamp,
    /// Caller-supplied free text.
    pub text: Option<&'a str>,
}

fn tokens(template: &str) -> Result<Vec<(usize, usize, &str)>> {
    let bad = |message: String| DatError::Output {
        output: template.to_string(),
        message,
    };
    let mut found = Vec::new();
    let mut rest = 0;
    while let Some(open) = template[rest..].find('{') {
        let start = rest + open;
        let Some(close) = template[start..].find('}') else {
            return Err(bad("unclosed '{' in file name template".to_string()));
        };
        let end = start + close;
        let name = &template[start + 1..end];
        if !TOKENS.contains(&name) {
            return Err(bad(format!("unknown template token '{{{name}}}'")));
        }
        found.push((start, end + 1, name));
        rest = end + 1;
    }
    if template[rest..].contains('}') {
        return Err(bad("unmatched '}' in file name template".to_string()));
    }
    Ok(found)
}

/// Checks a file name template for unknown tokens and unbalanced braces.
///
/// # Errors
///
/// Returns [`DatError::Output`] describing the first problem.
pub fn check_template(template: &str) -> Result<()> {
    tokens(template).map(|_| ())
}

/// Renders a file name (without extension) from a template.
///
/// The result is sanitized to `[A-Za-z0-9._-]`.
///
/// # Errors
///
/// Returns [`DatError::Output`] for a malformed template.
pub fn render_file_name(template: &str, vars: &FileNameVars<'_>) -> Result<String> {
    let mut out = String::new();
    let mut last = 0;
    for (start, end, name) in tokens(template)? {
        out.push_str(&template[last..start]);
        match name {
            "output" => out.push_str(vars.output),
            "profile" => out.push_str(vars.profile),
            "profile_id" => out.push_str(vars.profile_id),
            "version" => out.push_str(&vars.version.to_string()),
            "timestamp" => out.push_str(&format_compact(&vars.timestamp)),
            _ => out.push_str(&sanitize_component(vars.text.unwrap_or_default())),
        }
        last = end;
    }
    out.push_str(&template[last..]);
    Ok(sanitize_component(&out))
}

/// Returns the output definitions of a profile, or one pass-through output
/// per table (quarantine tables included) when none are declared.
#[must_use]
pub fn effective_outputs(profile: &Profile) -> Vec<OutputDef> {
    if !profile.outputs.is_empty() {
        return profile.outputs.clone();
    }
    profile
        .table_ids()
        .into_iter()
        .map(|id| OutputDef {
            name: id.clone(),
            tables: vec![id],
            include_context: false,
            aggregation: None,
            join: None,
            file_name: None,
        })
        .collect()
}

fn with_context(table: &ExtractedTable) -> DataFrame {
    let mut df = table.dataframe.clone();
    let rows = df.row_count();
    for (key, value) in &table.context {
        if !df.has_column(key) {
            df.set_column(key, vec![value.clone(); rows]);
        }
    }
    df
}

fn gather(tables: &[ExtractedTable], table_id: &str, include_context: bool) -> Vec<DataFrame> {
    tables
        .iter()
        .filter(|t| t.table_id == table_id)
        .map(|t| {
            if include_context {
                with_context(t)
            } else {
                t.dataframe.clone()
            }
        })
        .collect()
}

fn build_output(output: &OutputDef, tables: &[ExtractedTable]) -> Result<DataFrame> {
    if let Some(join) = &output.join {
        let left = DataFrame::concat(&gather(tables, &join.left, output.include_context));
        let right = DataFrame::concat(&gather(tables, &join.right, output.include_context));
        for key in &join.on {
            if (!left.is_empty() && !left.has_column(key)) || (!right.is_empty() && !right.has_column(key)) {
                return Err(DatError::Output {
                    output: output.name.clone(),
                    message: format!("join key '{key}' is missing from a joined table"),
                });
            }
        }
        return Ok(DataFrame::join(&left, &right, &join.on, join.how));
    }

    let frames: Vec<DataFrame> = output
        .tables
        .iter()
        .flat_map(|id| gather(tables, id, output.include_context))
        .collect();
    let combined = DataFrame::concat(&frames);

    let Some(aggregation) = &output.aggregation else {
        return Ok(combined);
    };
    if !combined.is_empty() {
        if let Some(key) = aggregation.group_by.iter().find(|k| !combined.has_column(k)) {
            return Err(DatError::Output {
                output: output.name.clone(),
                message: format!("group-by column '{key}' is missing"),
            });
        }
    }
    let reducers: Vec<_> = aggregation
        .reducers
        .iter()
        .map(|r| (r.column.clone(), r.function, r.output_name()))
        .collect();
    Ok(combined.group_by(&aggregation.group_by, &reducers))
}

/// Builds every output of `profile` from the committed tables.
///
/// Tables extracted from several files under the same id are concatenated
/// in the order given.
///
/// # Errors
///
/// Returns [`DatError::Output`] if a join or group-by key is missing.
pub fn build_outputs(tables: &[ExtractedTable], profile: &Profile) -> Result<IndexMap<String, DataFrame>> {
    let mut outputs = IndexMap::new();
    for output in effective_outputs(profile) {
        let df = build_output(&output, tables)?;
        debug!(output = %output.name, rows = df.row_count(), "Output built");
        outputs.insert(output.name, df);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{AggregationDef, OutputJoin, ReducerDef};
    use crate::frame::{JoinKind, Reducer};
    use chrono::TimeZone;
    use serde_json::{json, Map, Value};

    fn table(id: &str, source: &str, lot: &str, records: Value) -> ExtractedTable {
        let Value::Array(records) = records else {
            panic!("records must be an array");
        };
        let mut t = ExtractedTable::new(id, source, DataFrame::from_records(&records, None));
        let mut context = Map::new();
        context.insert("lot".to_string(), json!(lot));
        t.context = context;
        t
    }

    fn profile_with(outputs: Vec<OutputDef>) -> Profile {
        let mut profile = crate::profile::sample_profile();
        profile.outputs = outputs;
        profile
    }

    fn output(name: &str, tables: &[&str]) -> OutputDef {
        OutputDef {
            name: name.to_string(),
            tables: tables.iter().map(ToString::to_string).collect(),
            include_context: false,
            aggregation: None,
            join: None,
            file_name: None,
        }
    }

    fn tables() -> Vec<ExtractedTable> {
        vec![
            table("sites", "a.json", "L1", json!([{"site": 1, "v": 2.0}, {"site": 2, "v": 4.0}])),
            table("sites", "b.json", "L2", json!([{"site": 1, "v": 6.0}])),
            table("meta", "a.json", "L1", json!([{"site": 1, "tool": "T9"}])),
        ]
    }

    #[test]
    fn test_concat_with_context() {
        let mut out = output("all", &["sites"]);
        out.include_context = true;
        let built = build_outputs(&tables(), &profile_with(vec![out])).unwrap();
        let df = &built["all"];
        assert_eq!(df.columns(), &["site", "v", "lot"]);
        assert_eq!(df.row_count(), 3);
        assert_eq!(df.get(2, "lot"), Some(&json!("L2")));
    }

    #[test]
    fn test_aggregation() {
        let mut out = output("by_site", &["sites"]);
        out.aggregation = Some(AggregationDef {
            group_by: vec!["site".to_string()],
            reducers: vec![ReducerDef {
                column: "v".to_string(),
                function: Reducer::Mean,
                alias: None,
            }],
        });
        let built = build_outputs(&tables(), &profile_with(vec![out])).unwrap();
        let df = &built["by_site"];
        assert_eq!(df.columns(), &["site", "v_mean"]);
        assert_eq!(df.get(0, "v_mean"), Some(&json!(4)));
        assert_eq!(df.get(1, "v_mean"), Some(&json!(4)));
    }

    #[test]
    fn test_join_and_missing_key() {
        let mut out = output("joined", &[]);
        out.join = Some(OutputJoin {
            left: "sites".to_string(),
            right: "meta".to_string(),
            on: vec!["site".to_string()],
            how: JoinKind::Left,
        });
        let built = build_outputs(&tables(), &profile_with(vec![out.clone()])).unwrap();
        let df = &built["joined"];
        assert_eq!(df.row_count(), 3);
        assert_eq!(df.get(0, "tool"), Some(&json!("T9")));
        assert_eq!(df.get(1, "tool"), Some(&json!(null)));

        if let Some(join) = &mut out.join {
            join.on = vec!["wafer".to_string()];
        }
        let err = build_outputs(&tables(), &profile_with(vec![out])).unwrap_err();
        assert_eq!(err.code(), "DAT-OUTPUT");
    }

    #[test]
    fn test_default_outputs_per_table() {
        let built = build_outputs(&tables(), &profile_with(Vec::new())).unwrap();
        let names: Vec<&String> = built.keys().collect();
        assert_eq!(names, vec!["sites", "sites_rejected"]);
        assert_eq!(built["sites_rejected"].row_count(), 0);
    }

    #[test]
    fn test_render_file_name() {
        let vars = FileNameVars {
            output: "all sites",
            profile: "wafer",
            profile_id: "abcd1234",
            version: 3,
            timestamp: chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            text: Some("Q2 / final"),
        };
        let name = render_file_name("{profile}_v{version}_{output}_{timestamp}_{text}", &vars).unwrap();
        assert_eq!(name, "wafer_v3_all-sites_20240501T123000Z_Q2-final");
        assert_eq!(render_file_name("{profile_id}", &vars).unwrap(), "abcd1234");
        assert_eq!(render_file_name("{text}", &FileNameVars { text: None, ..vars }).unwrap(), "untitled");
        assert!(check_template("{nope}").is_err());
        assert!(check_template("{output").is_err());
        assert!(check_template("out}").is_err());
    }
}
