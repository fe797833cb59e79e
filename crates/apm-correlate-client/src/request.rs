//! Pending requests travelling through the pipeline

use crate::error::CorrelateError;
use apm_correlate_core::{Correlation, DedupKey, Operation, RequestToken};
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Raw outcome handed to a request's completion callback
#[derive(Debug)]
pub struct RawResponse {
    /// Response body, empty when no response was received
    pub body: Vec<u8>,

    /// Response status, `None` on transport failure
    pub status: Option<StatusCode>,

    /// Failure, `None` on success
    pub error: Option<CorrelateError>,
}

impl RawResponse {
    pub fn success(body: Vec<u8>) -> Self {
        Self {
            body,
            status: Some(StatusCode::OK),
            error: None,
        }
    }

    pub fn failure(body: Vec<u8>, status: Option<StatusCode>, error: CorrelateError) -> Self {
        Self {
            body,
            status,
            error: Some(error),
        }
    }

    /// The status is in the 4xx range
    pub fn is_client_error(&self) -> bool {
        self.status.is_some_and(|s| s.is_client_error())
    }
}

/// Completion callback, consumed on first use
pub type Completion = Box<dyn FnOnce(RawResponse) + Send>;

/// A correlation request and its lifecycle state
pub struct PendingRequest {
    id: u64,
    correlation: Arc<Correlation>,
    operation: Operation,
    token: RequestToken,
    attempts: AtomicU32,
    send_at: Mutex<Option<Instant>>,
    completion: Mutex<Option<Completion>>,
}

impl PendingRequest {
    pub fn new(
        id: u64,
        operation: Operation,
        correlation: Arc<Correlation>,
        token: RequestToken,
        completion: Completion,
    ) -> Self {
        Self {
            id,
            correlation,
            operation,
            token,
            // the original send is the first attempt
            attempts: AtomicU32::new(1),
            send_at: Mutex::new(None),
            completion: Mutex::new(Some(completion)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn correlation(&self) -> &Arc<Correlation> {
        &self.correlation
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.operation, &self.correlation)
    }

    pub fn token(&self) -> &RequestToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Attempts made or scheduled so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Count one more attempt unless `max` has been reached
    pub(crate) fn try_add_attempt(&self, max: u32) -> bool {
        self.attempts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn send_at(&self) -> Option<Instant> {
        *self.send_at.lock()
    }

    pub(crate) fn set_send_at(&self, at: Instant) {
        *self.send_at.lock() = Some(at);
    }

    /// Run the completion callback. Returns false if it already ran.
    pub(crate) fn complete(&self, response: RawResponse) -> bool {
        let completion = self.completion.lock().take();
        match completion {
            Some(completion) => {
                completion(response);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("correlation", &self.correlation)
            .field("attempts", &self.attempts())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_correlate_core::Lifecycle;
    use std::sync::atomic::AtomicUsize;

    fn request(completion: Completion) -> PendingRequest {
        PendingRequest::new(
            7,
            Operation::Upsert,
            Arc::new(Correlation::new("host", "web-1", "service", "checkout")),
            Lifecycle::new().token(),
            completion,
        )
    }

    #[test]
    fn test_completion_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let req = request(Box::new(move |response| {
            assert!(response.error.is_none());
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(req.complete(RawResponse::success(Vec::new())));
        assert!(!req.complete(RawResponse::success(Vec::new())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attempt_limit() {
        let req = request(Box::new(|_| {}));
        assert_eq!(req.attempts(), 1);
        assert!(req.try_add_attempt(3));
        assert!(req.try_add_attempt(3));
        assert!(!req.try_add_attempt(3));
        assert_eq!(req.attempts(), 3);
    }

    #[test]
    fn test_raw_response_client_error() {
        let response = RawResponse::failure(
            Vec::new(),
            Some(StatusCode::NOT_FOUND),
            CorrelateError::from_status(404),
        );
        assert!(response.is_client_error());

        let response = RawResponse::failure(
            Vec::new(),
            None,
            CorrelateError::Network("refused".to_string()),
        );
        assert!(!response.is_client_error());
    }

    #[test]
    fn test_cancel() {
        let req = request(Box::new(|_| {}));
        assert!(!req.is_cancelled());
        req.cancel();
        assert!(req.is_cancelled());
        assert_eq!(req.dedup_key().corr_type, "service");
    }
}
