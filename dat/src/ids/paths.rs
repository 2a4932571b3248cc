//! Workspace-relative path handling.

use std::path::{Component, Path, PathBuf};

use crate::errors::{DatError, Result};

/// Converts `path` into a normalized, `/`-separated path relative to `root`.
///
/// Absolute paths must live under `root`; relative paths are taken as
/// already relative to it. Any path that escapes the workspace is rejected.
pub fn workspace_relative(root: &Path, path: &Path) -> Result<String> {
    let relative = if path.is_absolute() {
        path.strip_prefix(root).map_err(|_| DatError::PathSafety {
            path: path.to_path_buf(),
            reason: "path is outside the workspace".to_string(),
        })?
    } else {
        path
    };

    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(DatError::PathSafety {
                        path: path.to_path_buf(),
                        reason: "path escapes the workspace".to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(DatError::PathSafety {
                    path: path.to_path_buf(),
                    reason: "unexpected root component".to_string(),
                });
            }
        }
    }
    Ok(parts.join("/"))
}

/// Resolves a workspace-relative path to a filesystem path under `root`.
pub fn resolve_in_workspace(root: &Path, relative: &str) -> Result<PathBuf> {
    let normalized = workspace_relative(root, Path::new(relative))?;
    if Path::new(relative).is_absolute() {
        return Err(DatError::PathSafety {
            path: PathBuf::from(relative),
            reason: "expected a workspace-relative path".to_string(),
        });
    }
    Ok(root.join(normalized))
}

/// Maps free text to a file-name-safe component (`[A-Za-z0-9._-]`).
#[must_use]
pub fn sanitize_component(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_dash = false;
    for ch in text.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_relative_absolute() {
        let root = Path::new("/work/space");
        let rel = workspace_relative(root, Path::new("/work/space/data/a.csv")).unwrap();
        assert_eq!(rel, "data/a.csv");
    }

    #[test]
    fn test_workspace_relative_normalizes() {
        let root = Path::new("/work");
        let rel = workspace_relative(root, Path::new("./data/../data/b.json")).unwrap();
        assert_eq!(rel, "data/b.json");
    }

    #[test]
    fn test_workspace_relative_rejects_escape() {
        let root = Path::new("/work");
        assert!(workspace_relative(root, Path::new("../etc/passwd")).is_err());
        assert!(workspace_relative(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_resolve_in_workspace() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_in_workspace(root, "out/x.csv").unwrap(),
            PathBuf::from("/work/out/x.csv")
        );
        assert!(resolve_in_workspace(root, "/abs/x.csv").is_err());
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("Lot 42 / run#7"), "Lot-42-run-7");
        assert_eq!(sanitize_component("  "), "untitled");
        assert_eq!(sanitize_component("ok_name-1.2"), "ok_name-1.2");
    }
}
