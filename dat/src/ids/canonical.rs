//! Canonicalization and hashing of stage inputs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::StageType;

/// Default number of hex characters in a stage id.
pub const DEFAULT_ID_LENGTH: usize = 8;

/// A computed stage id together with the full digest it was cut from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageId {
    /// The short id (hex prefix).
    pub id: String,
    /// The full SHA-256 hex digest of the canonical inputs.
    pub input_hash: String,
}

impl StageId {
    /// Computes the id for a stage from its inputs.
    #[must_use]
    pub fn compute(stage: StageType, inputs: &serde_json::Value, length: usize) -> Self {
        let input_hash = input_hash(stage, inputs);
        let id = input_hash[..length.clamp(1, input_hash.len())].to_string();
        Self { id, input_hash }
    }
}

/// Returns a canonical form of `value`: object keys sorted, every array
/// sorted by its elements' canonical text and de-duplicated.
#[must_use]
pub fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            let mut canon: Vec<(String, serde_json::Value)> = items
                .iter()
                .map(|item| {
                    let c = canonicalize(item);
                    (canonical_text(&c), c)
                })
                .collect();
            canon.sort_by(|a, b| a.0.cmp(&b.0));
            canon.dedup_by(|a, b| a.0 == b.0);
            serde_json::Value::Array(canon.into_iter().map(|(_, v)| v).collect())
        }
        other => other.clone(),
    }
}

/// Serializes an already-canonical value with keys in sorted order.
///
/// `serde_json` may preserve insertion order, so the writer walks objects
/// itself rather than relying on map ordering.
fn canonical_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_text(&map[k])
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        serde_json::Value::Array(items) => {
            let body = items.iter().map(canonical_text).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

/// Returns the full SHA-256 hex digest of a stage's canonical inputs.
#[must_use]
pub fn input_hash(stage: StageType, inputs: &serde_json::Value) -> String {
    let canonical = canonical_text(&canonicalize(inputs));
    let mut hasher = Sha256::new();
    hasher.update(stage.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns the SHA-256 hex digest of a document with keys sorted and array
/// order kept, for content addressing of ordered documents such as profiles.
#[must_use]
pub fn content_hash(value: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(canonical_text(value).as_bytes()))
}

/// Computes a stage id: a `length`-character hex prefix of [`input_hash`].
///
/// Pure and total. Callers must not pass absolute paths or wall-clock values.
#[must_use]
pub fn compute_id(stage: StageType, inputs: &serde_json::Value, length: usize) -> String {
    StageId::compute(stage, inputs, length).id
}
