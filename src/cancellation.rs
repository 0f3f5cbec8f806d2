//! Cooperative cancellation, threaded explicitly through long operations.
//!
//! Grounded on the pack's `loom-server-jobs::CancellationToken` (used by
//! `MirrorSyncJob::run` to bail out between repos); here it is a plain
//! `Arc<AtomicBool>` rather than async-aware, matching this crate's
//! synchronous, thread-based execution model (spec §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ErrorKind, GitMirrorError, Result};

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Checked at every process-spawn boundary and between walker
    /// iterations per spec §5.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GitMirrorError::new(
                ErrorKind::OperationCancelled,
                "operation cancelled",
            ))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_until_cancelled() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.check().is_err());
    }

    #[test]
    fn clones_share_cancellation_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
