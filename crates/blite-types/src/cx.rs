//! Cooperative cancellation token.
//!
//! Every suspending call in the engine takes `cx: &Cx` as its first argument
//! and checks it before touching durable state. Cancellation is advisory:
//! a call that has already flushed its commit record completes normally.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use blite_error::{BliteError, Result};

/// Cloneable cancellation handle. All clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancelled: Arc<AtomicBool>,
}

impl Cx {
    /// Fresh token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Bail out with [`BliteError::Cancelled`] if the signal has fired.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(BliteError::Cancelled);
        }
        Ok(())
    }
}
