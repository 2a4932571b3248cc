//! # DAT
//!
//! A deterministic, profile-driven data ingestion pipeline.
//!
//! A run moves a set of raw files through eight stages, from discovery to
//! export. Each stage can be locked, which freezes its inputs behind a
//! content-derived id and persists its result as an immutable artifact:
//!
//! - **Lockable stage graph**: gating rules decide what may lock, unlocking cascades downstream
//! - **Deterministic ids**: identical inputs produce identical ids and reuse the stored artifact
//! - **Profiles**: versioned declarative descriptions of tables, validation, transforms and outputs
//! - **Cooperative cancellation**: long stages stop at table boundaries and keep committed work
//! - **Event-driven observability**: every state change is reported to an injected sink
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dat::prelude::*;
//!
//! let orchestrator = Orchestrator::new(workspace, profiles, DatConfig::default())?;
//! let run = orchestrator.create_run().await?;
//!
//! let discovery = StageRequest::Discovery {
//!     root: "data".into(),
//!     include: vec!["*.json".into()],
//!     exclude: vec![],
//!     recursive: true,
//! };
//! orchestrator.lock(&run.run_id, discovery).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod adapters;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod extract;
pub mod frame;
pub mod graph;
pub mod ids;
pub mod observability;
pub mod orchestrator;
pub mod output;
pub mod profile;
pub mod transform;
pub mod utils;
pub mod validation;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adapters::{AdapterRegistry, FileAdapter};
    pub use crate::cancellation::{Checkpoint, CheckpointType, CancellationToken};
    pub use crate::config::DatConfig;
    pub use crate::core::{ArtifactManifest, StageStatus, StageType, TableStatus};
    pub use crate::errors::{DatError, Diagnostic, Result};
    pub use crate::events::{DatEvent, EventKind, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::frame::DataFrame;
    pub use crate::graph::StageGraphConfig;
    pub use crate::ids::{StageId, StageInputs};
    pub use crate::orchestrator::{
        ExportFormat, Orchestrator, ParseOptions, ProbeOptions, StagePayload, StageRequest, StageResult,
    };
    pub use crate::profile::{Profile, ProfileStore};
}
