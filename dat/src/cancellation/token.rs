//! Cooperative cancellation of a running stage.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::StageType;
use crate::errors::{DatError, Result};

#[derive(Debug, Default)]
struct Shared {
    requested: AtomicBool,
    reason: RwLock<Option<String>>,
}

/// A caller-supplied stop signal for one stage execution.
///
/// Clones share state, so the orchestrator can keep one handle while the
/// stage body polls another. Only the first reason is kept. Stages observe
/// the token at checkpoint boundaries and never mid-table.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    /// Creates an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns false if it was already requested.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.shared.reason.write();
        if self.shared.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        *slot = Some(reason.into());
        true
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.requested.load(Ordering::SeqCst)
    }

    /// Returns the first cancellation reason.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.shared.reason.read().clone()
    }

    /// Polls the token at a checkpoint of `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Cancellation`] once cancellation was requested.
    pub fn check(&self, stage: StageType) -> Result<()> {
        if !self.is_cancelled() {
            return Ok(());
        }
        Err(DatError::Cancellation {
            stage,
            reason: self.reason().unwrap_or_else(|| "cancelled".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        let handle = token.clone();
        assert!(token.check(StageType::Parse).is_ok());

        assert!(handle.cancel("user abort"));
        assert!(!handle.cancel("second reason"));
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("user abort"));

        match token.check(StageType::Parse) {
            Err(DatError::Cancellation { stage, reason }) => {
                assert_eq!(stage, StageType::Parse);
                assert_eq!(reason, "user abort");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let token = CancellationToken::new();
        let handle = token.clone();
        std::thread::spawn(move || handle.cancel("shutdown"))
            .join()
            .unwrap();
        assert!(token.check(StageType::Export).unwrap_err().to_string().contains("shutdown"));
    }
}
