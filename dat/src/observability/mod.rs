//! Observability utilities: subscriber installation and stage spans.

mod spans;
mod subscriber;

pub use spans::{stage_span, StageTimer};
pub use subscriber::init_tracing;
