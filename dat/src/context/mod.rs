//! Per-file context resolution.
//!
//! Each declared key is resolved in strict priority order:
//!
//! 1. an allow-listed user override,
//! 2. the first matching content pattern (JSONPath into the file),
//! 3. the first matching regex on the file name or path,
//! 4. the profile's static default.
//!
//! The level that produced each value is recorded for diagnostics.

mod config;
mod extractor;

pub use config::{
    ContentPattern, ContextConfig, ContextKeyDef, ContextOnFail, RegexPattern, RegexTarget, ValueTransform,
};
pub use extractor::{ContextExtractor, ExtractionContext, ResolutionLevel, ResolvedValue};
