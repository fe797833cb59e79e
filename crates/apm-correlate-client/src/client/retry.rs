//! Retry queue admission and the retry worker

use super::Shared;
use crate::error::{CorrelateError, CorrelateResult};
use crate::request::PendingRequest;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::debug;

impl Shared {
    /// Queue a transiently failed request for another attempt after the fixed delay
    pub(crate) fn schedule_retry(&self, request: &Arc<PendingRequest>) -> CorrelateResult<()> {
        if !request.try_add_attempt(self.max_attempts) {
            return Err(CorrelateError::MaxAttempts);
        }

        request.set_send_at(Instant::now() + self.send_delay);

        if self.lifecycle.is_cancelled() {
            return Err(CorrelateError::Shutdown);
        }
        if request.is_cancelled() {
            return Err(CorrelateError::RequestCancelled);
        }

        match self.retry_tx.try_send(Arc::clone(request)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CorrelateError::RetryQueueFull),
            Err(TrySendError::Closed(_)) => Err(CorrelateError::Shutdown),
        }
    }
}

/// Retry worker loop. Exits when the client lifecycle is cancelled.
pub(crate) async fn run(shared: Arc<Shared>, mut retries: mpsc::Receiver<Arc<PendingRequest>>) {
    loop {
        let request = tokio::select! {
            biased;
            _ = shared.lifecycle.cancelled() => break,
            next = retries.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        if request.is_cancelled() {
            shared.dedup.release(&request);
            continue;
        }

        let send_at = request.send_at().unwrap_or_else(Instant::now);
        tokio::select! {
            biased;
            _ = shared.lifecycle.cancelled() => break,
            _ = request.token().cancelled() => {
                shared.dedup.release(&request);
            }
            _ = tokio::time::sleep_until(send_at) => {
                shared.stats.record_retry();
                shared.dispatch(Arc::clone(&request)).await;
            }
        }
    }
    debug!("Correlation retry worker stopped");
}
