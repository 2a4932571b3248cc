//! Adapter registry keyed by extension and MIME type.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::{extension_of, CsvAdapter, ExcelAdapter, FileAdapter, JsonAdapter, ParquetAdapter};
use crate::errors::{DatError, Result};

/// Registry mapping file extensions and MIME types to adapters.
///
/// Read-mostly; shared across runs behind an `Arc`.
pub struct AdapterRegistry {
    by_extension: RwLock<HashMap<String, Arc<dyn FileAdapter>>>,
    by_mime: RwLock<HashMap<String, Arc<dyn FileAdapter>>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("extensions", &self.extensions())
            .finish()
    }
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            by_extension: RwLock::new(HashMap::new()),
            by_mime: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with the CSV, Excel, JSON and Parquet adapters.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(CsvAdapter::new()));
        registry.register(Arc::new(ExcelAdapter::new()));
        registry.register(Arc::new(JsonAdapter::new()));
        registry.register(Arc::new(ParquetAdapter::new()));
        registry
    }

    /// Registers an adapter for all its extensions and MIME types, replacing
    /// any previous adapter for them.
    pub fn register(&self, adapter: Arc<dyn FileAdapter>) {
        {
            let mut by_extension = self.by_extension.write();
            for ext in adapter.extensions() {
                by_extension.insert(ext.to_ascii_lowercase(), adapter.clone());
            }
        }
        let mut by_mime = self.by_mime.write();
        for mime in adapter.mime_types() {
            by_mime.insert(mime.to_ascii_lowercase(), adapter.clone());
        }
    }

    /// Returns the adapter for a file's extension.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::AdapterNotFound`] for unregistered extensions.
    pub fn get_adapter_for_file(&self, path: &Path) -> Result<Arc<dyn FileAdapter>> {
        let extension = extension_of(path);
        self.by_extension
            .read()
            .get(&extension)
            .cloned()
            .ok_or_else(|| DatError::AdapterNotFound {
                path: path.display().to_string(),
                extension,
            })
    }

    /// Returns the adapter for a MIME type.
    #[must_use]
    pub fn get_adapter_for_mime(&self, mime: &str) -> Option<Arc<dyn FileAdapter>> {
        self.by_mime.read().get(&mime.to_ascii_lowercase()).cloned()
    }

    /// Returns true if a file's extension has an adapter.
    #[must_use]
    pub fn supports(&self, path: &Path) -> bool {
        self.by_extension.read().contains_key(&extension_of(path))
    }

    /// Lists registered extensions, sorted.
    #[must_use]
    pub fn extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self.by_extension.read().keys().cloned().collect();
        extensions.sort();
        extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let registry = AdapterRegistry::with_builtins();
        assert_eq!(registry.get_adapter_for_file(Path::new("a/B.CSV")).unwrap().name(), "csv");
        assert_eq!(registry.get_adapter_for_file(Path::new("x.ndjson")).unwrap().name(), "json");
        assert_eq!(registry.get_adapter_for_file(Path::new("x.xlsx")).unwrap().name(), "excel");
        assert_eq!(registry.get_adapter_for_file(Path::new("x.parquet")).unwrap().name(), "parquet");
        assert_eq!(registry.get_adapter_for_mime("text/csv").unwrap().name(), "csv");
    }

    #[test]
    fn test_unregistered_extension() {
        let registry = AdapterRegistry::with_builtins();
        let err = registry.get_adapter_for_file(Path::new("notes.docx")).err().unwrap();
        assert_eq!(err.code(), "DAT-ADAPTER-NOT-FOUND");
        assert!(err.to_string().contains("docx"));
        assert!(!registry.supports(Path::new("README")));
    }
}
