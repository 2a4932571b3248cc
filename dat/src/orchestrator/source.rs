//! File-source abstraction consumed by Discovery and the stage workers.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::errors::{DatError, Result};
use crate::ids::{resolve_in_workspace, workspace_relative};
use crate::utils::Timestamp;

/// A candidate file as seen by a [`FileSource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Workspace-relative, `/`-separated path.
    pub relative_path: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when the source reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Timestamp>,
}

/// Provides candidate files: path, byte stream, size and modification time.
pub trait FileSource: Send + Sync + Debug {
    /// Lists files under a workspace-relative directory, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` is unsafe or cannot be listed.
    fn list(&self, root: &str, recursive: bool) -> Result<Vec<FileMeta>>;

    /// Returns the metadata of one file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist.
    fn metadata(&self, relative: &str) -> Result<FileMeta>;

    /// Opens a file for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    fn open(&self, relative: &str) -> Result<Box<dyn Read + Send>>;

    /// Resolves a file to a local path readable by the adapters.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::PathSafety`] for a path escaping the workspace.
    fn local_path(&self, relative: &str) -> Result<PathBuf>;
}

/// A [`FileSource`] over a local directory tree.
///
/// Hidden entries (names starting with `.`) are never listed, which keeps
/// the run state directory out of discovery.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    root: PathBuf,
}

impl LocalFileSource {
    /// Creates a source rooted at the workspace directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the workspace root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn meta_of(&self, path: &Path, metadata: &std::fs::Metadata) -> Result<FileMeta> {
        Ok(FileMeta {
            relative_path: workspace_relative(&self.root, path)?,
            size: metadata.len(),
            modified: metadata.modified().ok().map(Timestamp::from),
        })
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_str().is_some_and(|name| name.starts_with('.'))
}

impl FileSource for LocalFileSource {
    fn list(&self, root: &str, recursive: bool) -> Result<Vec<FileMeta>> {
        let dir = resolve_in_workspace(&self.root, root)?;
        if !dir.is_dir() {
            return Err(DatError::input(root, "discovery root is not a directory"));
        }

        let mut walker = WalkDir::new(&dir).follow_links(false);
        if !recursive {
            walker = walker.max_depth(1);
        }
        let mut files = Vec::new();
        for entry in walker.into_iter().filter_entry(|e| !is_hidden(e)) {
            let entry = entry.map_err(|e| DatError::input(root, e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| DatError::input(entry.path().display().to_string(), e.to_string()))?;
            files.push(self.meta_of(entry.path(), &metadata)?);
        }
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(files)
    }

    fn metadata(&self, relative: &str) -> Result<FileMeta> {
        let path = self.local_path(relative)?;
        let metadata = std::fs::metadata(&path).map_err(|e| DatError::io(&path, e))?;
        self.meta_of(&path, &metadata)
    }

    fn open(&self, relative: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.local_path(relative)?;
        let file = File::open(&path).map_err(|e| DatError::io(&path, e))?;
        Ok(Box::new(file))
    }

    fn local_path(&self, relative: &str) -> Result<PathBuf> {
        resolve_in_workspace(&self.root, relative)
    }
}
