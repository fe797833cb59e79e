//! Cooperative cancellation scopes
//!
//! A [`Lifecycle`] is the client-wide scope: when it is cancelled every worker
//! and every in-flight request winds down. A [`RequestToken`] is the per-request
//! scope, derived from a lifecycle so that it reads as cancelled once either
//! itself or its parent has been cancelled.

use std::sync::Arc;
use tokio::sync::watch;

/// Client-wide cancellation scope
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<bool>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Cancel the scope. Idempotent.
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the scope is cancelled (immediately if it already is)
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender is owned by `self`, so the wait can only end by cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Create a per-request token bound to this scope
    pub fn token(&self) -> RequestToken {
        RequestToken {
            own: Lifecycle::new(),
            parent: self.clone(),
        }
    }
}

/// Per-request cancellation handle
#[derive(Debug, Clone)]
pub struct RequestToken {
    own: Lifecycle,
    parent: Lifecycle,
}

impl RequestToken {
    /// Cancel this request only; the parent scope is unaffected
    pub fn cancel(&self) {
        self.own.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.is_cancelled() || self.parent.is_cancelled()
    }

    /// Resolves once the request or its parent scope is cancelled
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.own.cancelled() => {}
            _ = self.parent.cancelled() => {}
        }
    }
}
