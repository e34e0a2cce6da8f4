//! Cooperative cancellation (§5): a token polled at round/function boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::DecompilerError;

/// A cheaply-cloned handle shared between the orchestrator and every
/// analysis it runs. Raising it causes the next `poll()` to return
/// `Err(DecompilerError::Canceled)`.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    canceled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Must be called between basic blocks in dataflow, between iterations
    /// in signature analysis, and between functions in the orchestrator (§5)
    /// — a missing poll point turns cancellation into an indefinite wait.
    pub fn poll(&self) -> Result<(), DecompilerError> {
        if self.is_canceled() {
            Err(DecompilerError::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_succeeds_until_canceled() {
        let token = CancellationToken::new();
        assert!(token.poll().is_ok());
        token.cancel();
        assert!(token.poll().is_err());
    }
}
