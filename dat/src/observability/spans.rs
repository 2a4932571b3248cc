//! Stage spans and timing.

use std::time::Instant;
use tracing::{info_span, Span};

use crate::core::StageType;

/// Creates the span every stage operation runs in.
#[must_use]
pub fn stage_span(run_id: &str, stage: StageType, operation: &'static str) -> Span {
    info_span!("dat.stage", run_id = %run_id, stage = %stage, operation)
}

/// Wall-clock timer for a stage's work.
#[derive(Debug)]
pub struct StageTimer {
    start: Instant,
    stage: StageType,
}

impl StageTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start(stage: StageType) -> Self {
        Self {
            start: Instant::now(),
            stage,
        }
    }

    /// Returns the timed stage.
    #[must_use]
    pub fn stage(&self) -> StageType {
        self.stage
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}
