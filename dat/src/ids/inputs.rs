//! Typed canonical input sets, one per stage.

use serde_json::json;
use std::collections::BTreeMap;

use super::canonical::StageId;
use crate::core::StageType;

/// The exact inputs that determine each stage's id.
///
/// | Stage | Canonical inputs |
/// |---|---|
/// | Discovery | relative root, sorted include/exclude patterns, recursive flag |
/// | Selection | discovery_id, sorted relative file paths, profile_id |
/// | Context | selection_id, sorted override keys/values |
/// | TableAvailability | selection_id, profile_id, probe options |
/// | TableSelection | table_availability_id, sorted table ids |
/// | Preview | table_selection_id, preview options |
/// | Parse | table_selection_id, profile_id, context_id, parse options |
/// | Export | parse_id, sorted output formats, output path |
#[derive(Debug, Clone, PartialEq)]
pub enum StageInputs {
    /// Discovery inputs.
    Discovery {
        /// Workspace-relative root directory.
        root: String,
        /// Include glob patterns.
        include: Vec<String>,
        /// Exclude glob patterns.
        exclude: Vec<String>,
        /// Whether to descend into subdirectories.
        recursive: bool,
    },
    /// Selection inputs.
    Selection {
        /// Id of the locked discovery stage.
        discovery_id: String,
        /// Selected workspace-relative file paths.
        files: Vec<String>,
        /// Content hash of the profile.
        profile_id: String,
    },
    /// Context inputs.
    Context {
        /// Id of the locked selection stage.
        selection_id: String,
        /// User override values by key.
        overrides: BTreeMap<String, serde_json::Value>,
    },
    /// Table availability inputs.
    TableAvailability {
        /// Id of the locked selection stage.
        selection_id: String,
        /// Content hash of the profile.
        profile_id: String,
        /// Probe options.
        probe: serde_json::Value,
    },
    /// Table selection inputs.
    TableSelection {
        /// Id of the locked table availability stage.
        table_availability_id: String,
        /// Selected table ids.
        tables: Vec<String>,
    },
    /// Preview inputs.
    Preview {
        /// Id of the locked table selection stage.
        table_selection_id: String,
        /// Preview options.
        options: serde_json::Value,
    },
    /// Parse inputs.
    Parse {
        /// Id of the locked table selection stage.
        table_selection_id: String,
        /// Content hash of the profile.
        profile_id: String,
        /// Id of the locked context stage, `None` when it was skipped.
        context_id: Option<String>,
        /// Parse options.
        options: serde_json::Value,
    },
    /// Export inputs.
    Export {
        /// Id of the locked parse stage.
        parse_id: String,
        /// Output formats.
        formats: Vec<String>,
        /// Workspace-relative output directory.
        output_path: String,
    },
}

impl StageInputs {
    /// Returns the stage these inputs belong to.
    #[must_use]
    pub fn stage(&self) -> StageType {
        match self {
            Self::Discovery { .. } => StageType::Discovery,
            Self::Selection { .. } => StageType::Selection,
            Self::Context { .. } => StageType::Context,
            Self::TableAvailability { .. } => StageType::TableAvailability,
            Self::TableSelection { .. } => StageType::TableSelection,
            Self::Preview { .. } => StageType::Preview,
            Self::Parse { .. } => StageType::Parse,
            Self::Export { .. } => StageType::Export,
        }
    }

    /// Returns the inputs as a JSON object ready for canonicalization.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Discovery {
                root,
                include,
                exclude,
                recursive,
            } => json!({
                "root": root,
                "include": include,
                "exclude": exclude,
                "recursive": recursive,
            }),
            Self::Selection {
                discovery_id,
                files,
                profile_id,
            } => json!({
                "discovery_id": discovery_id,
                "files": files,
                "profile_id": profile_id,
            }),
            Self::Context {
                selection_id,
                overrides,
            } => json!({
                "selection_id": selection_id,
                "overrides": overrides,
            }),
            Self::TableAvailability {
                selection_id,
                profile_id,
                probe,
            } => json!({
                "selection_id": selection_id,
                "profile_id": profile_id,
                "probe": probe,
            }),
            Self::TableSelection {
                table_availability_id,
                tables,
            } => json!({
                "table_availability_id": table_availability_id,
                "tables": tables,
            }),
            Self::Preview {
                table_selection_id,
                options,
            } => json!({
                "table_selection_id": table_selection_id,
                "options": options,
            }),
            Self::Parse {
                table_selection_id,
                profile_id,
                context_id,
                options,
            } => json!({
                "table_selection_id": table_selection_id,
                "profile_id": profile_id,
                "context_id": context_id,
                "options": options,
            }),
            Self::Export {
                parse_id,
                formats,
                output_path,
            } => json!({
                "parse_id": parse_id,
                "formats": formats,
                "output_path": output_path,
            }),
        }
    }

    /// Computes the stage id for these inputs.
    #[must_use]
    pub fn stage_id(&self, length: usize) -> StageId {
        StageId::compute(self.stage(), &self.to_value(), length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(files: &[&str]) -> StageInputs {
        StageInputs::Selection {
            discovery_id: "d1d2d3d4".to_string(),
            files: files.iter().map(|s| (*s).to_string()).collect(),
            profile_id: "p".to_string(),
        }
    }

    #[test]
    fn test_selection_order_is_irrelevant() {
        let a = selection(&["a.csv", "b.csv"]).stage_id(8);
        let b = selection(&["b.csv", "a.csv"]).stage_id(8);
        assert_eq!(a, b);
    }

    #[test]
    fn test_selection_change_changes_id() {
        let a = selection(&["a.csv", "b.csv"]).stage_id(8);
        let b = selection(&["a.csv"]).stage_id(8);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_parse_depends_on_context() {
        let base = StageInputs::Parse {
            table_selection_id: "t".to_string(),
            profile_id: "p".to_string(),
            context_id: None,
            options: serde_json::json!({}),
        };
        let with_context = StageInputs::Parse {
            table_selection_id: "t".to_string(),
            profile_id: "p".to_string(),
            context_id: Some("c0ffee00".to_string()),
            options: serde_json::json!({}),
        };
        assert_ne!(base.stage_id(8), with_context.stage_id(8));
        assert_eq!(base.stage(), StageType::Parse);
    }

    #[test]
    fn test_export_formats_sorted() {
        let a = StageInputs::Export {
            parse_id: "x".to_string(),
            formats: vec!["csv".to_string(), "parquet".to_string()],
            output_path: "out".to_string(),
        };
        let b = StageInputs::Export {
            parse_id: "x".to_string(),
            formats: vec!["parquet".to_string(), "csv".to_string()],
            output_path: "out".to_string(),
        };
        assert_eq!(a.stage_id(8), b.stage_id(8));
    }
}
