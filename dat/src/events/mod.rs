//! Stage lifecycle events.
//!
//! The orchestrator reports every state change to an injected [`EventSink`].
//! There is no process-wide sink; each orchestrator owns its own.

mod sink;

pub use sink::{CollectingEventSink, DatEvent, EventKind, EventSink, LoggingEventSink, NoOpEventSink};
