//! Glob patterns over workspace-relative paths.
//!
//! `*` matches within one path segment, `**` across segments and `?` one
//! character. A pattern without `/` is matched against the file name only.

use ::glob::{MatchOptions, Pattern};

use crate::errors::Result;

const OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: Pattern,
    name_only: bool,
}

impl Glob {
    /// Compiles a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`crate::errors::DatError::Glob`] for a malformed pattern,
    /// such as `**` that is not a whole path segment.
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: Pattern::new(pattern)?,
            name_only: !pattern.contains('/'),
        })
    }

    /// Returns the pattern source.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Tests a `/`-separated relative path.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let subject = if self.name_only {
            path.rsplit('/').next().unwrap_or(path)
        } else {
            path
        };
        self.pattern.matches_with(subject, OPTIONS)
    }
}

/// Include/exclude filter: a path passes if it matches any include (or the
/// include list is empty) and no exclude.
#[derive(Debug, Clone, Default)]
pub struct GlobFilter {
    include: Vec<Glob>,
    exclude: Vec<Glob>,
}

impl GlobFilter {
    /// Compiles include and exclude patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern fails to compile.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: include.iter().map(|p| Glob::new(p)).collect::<Result<_>>()?,
            exclude: exclude.iter().map(|p| Glob::new(p)).collect::<Result<_>>()?,
        })
    }

    /// Tests a relative path.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        (self.include.is_empty() || self.include.iter().any(|g| g.matches(path)))
            && !self.exclude.iter().any(|g| g.matches(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_only_patterns() {
        let glob = Glob::new("*.csv").unwrap();
        assert!(glob.matches("a.csv"));
        assert!(glob.matches("deep/dir/b.csv"));
        assert!(!glob.matches("a.csv.bak"));
    }

    #[test]
    fn test_path_patterns() {
        let glob = Glob::new("data/**/*.json").unwrap();
        assert!(glob.matches("data/x.json"));
        assert!(glob.matches("data/2024/01/x.json"));
        assert!(!glob.matches("other/x.json"));
        assert!(Glob::new("run_?.txt").unwrap().matches("run_1.txt"));
        assert!(!Glob::new("data/*.json").unwrap().matches("data/2024/x.json"));
    }

    #[test]
    fn test_malformed_pattern() {
        let err = Glob::new("data/a**").unwrap_err();
        assert_eq!(err.code(), "DAT-GLOB");
    }

    #[test]
    fn test_filter() {
        let filter = GlobFilter::new(&["*.csv".to_string()], &["tmp/**".to_string()]).unwrap();
        assert!(filter.matches("a/b.csv"));
        assert!(!filter.matches("tmp/b.csv"));
        assert!(!filter.matches("b.json"));
        assert!(GlobFilter::default().matches("anything"));
    }
}
