//! Deterministic, content-addressed stage identifiers and path safety.
//!
//! A stage id is a pure function of the stage's canonical inputs: the same
//! inputs yield the same id on every machine, and any semantically relevant
//! change yields a different id.

mod canonical;
mod inputs;
mod paths;

pub use canonical::{canonicalize, compute_id, content_hash, input_hash, StageId, DEFAULT_ID_LENGTH};
pub use inputs::StageInputs;
pub use paths::{resolve_in_workspace, sanitize_component, workspace_relative};
