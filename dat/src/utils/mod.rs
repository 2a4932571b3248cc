//! Shared helpers: timestamps and glob matching.

pub mod glob;
pub mod timestamps;

pub use glob::{Glob, GlobFilter};
pub use timestamps::{
    format_compact, format_manifest, manifest_timestamp, parse_datetime, Timestamp,
};
