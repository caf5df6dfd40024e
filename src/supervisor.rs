//! Fail-fast supervision scope shared by all background tasks.
//!
//! Any supervised task that fails records its error here and cancels the
//! whole application; the binary exits non-zero with the first recorded
//! failure. Orderly shutdown cancels without recording an error.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::AppError;

/// Shared cancellation scope plus the first fatal background error.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    cancel: CancellationToken,
    fatal: Arc<Mutex<Option<AppError>>>,
}

impl Supervisor {
    /// Create a fresh supervision scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the underlying cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the scope has been cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether the scope has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a fatal background failure and cancel every sibling task.
    /// Only the first failure is retained.
    pub fn fail(&self, err: AppError) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.cancel.cancel();
    }

    /// Cancel the scope without recording a failure (orderly shutdown).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Take the first recorded fatal error, if any.
    #[must_use]
    pub fn take_error(&self) -> Option<AppError> {
        self.fatal.lock().take()
    }
}
