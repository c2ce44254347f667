//! Cancellable execution context.

use std::sync::Arc;

use tokio::sync::watch;

/// A cancellable handle threaded through engine construction.
///
/// Clones share one cancellation signal. Cancellation is one-way: once
/// cancelled, a context stays cancelled.
#[derive(Debug, Clone)]
pub struct Context {
    state: Arc<watch::Sender<bool>>,
}

impl Context {
    /// Create a fresh, uncancelled context with no deadline.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { state: Arc::new(tx) }
    }

    /// Cancel the context. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        let was_cancelled = self.state.send_replace(true);
        if !was_cancelled {
            tracing::trace!("Context cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once the context is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
