//! Cooperative cancellation for request-scoped operations.

use crate::error::{Result, TwoFactorError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cancellation flag shared between a caller and an in-flight operation.
///
/// Operations check the token after their reads and before their first
/// write, so a cancelled operation never persists a partial change.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Return [`TwoFactorError::Cancelled`] if cancellation has been signalled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TwoFactorError::Cancelled);
        }
        Ok(())
    }
}
