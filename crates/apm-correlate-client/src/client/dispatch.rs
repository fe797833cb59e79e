//! Dispatcher: drains the submission queue and hands requests to the sender

use super::Shared;
use crate::error::{CorrelateError, CorrelateResult};
use crate::request::{PendingRequest, RawResponse};
use crate::sender::ResponseHandler;
use apm_correlate_core::Operation;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Request};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Header carrying the access token
pub const TOKEN_HEADER: &str = "x-sf-token";

/// Dispatcher loop. Exits when the client lifecycle is cancelled.
pub(crate) async fn run(shared: Arc<Shared>, mut requests: mpsc::Receiver<Arc<PendingRequest>>) {
    loop {
        tokio::select! {
            biased;
            _ = shared.lifecycle.cancelled() => break,
            next = requests.recv() => {
                let Some(request) = next else { break };
                if shared.dedup.is_duplicate(&request) {
                    trace!(
                        method = %request.operation(),
                        correlation = %request.correlation(),
                        "Dropping duplicate request"
                    );
                    shared.stats.record_deduplicated();
                    request.cancel();
                    continue;
                }
                shared.dispatch(request).await;
            }
        }
    }
    debug!("Correlation dispatcher stopped");
}

impl Shared {
    /// Build and send a request that owns its dedup key
    pub(crate) async fn dispatch(self: &Arc<Self>, request: Arc<PendingRequest>) {
        if request.is_cancelled() {
            self.dedup.release(&request);
            return;
        }

        let http_request = match self.build_request(&request) {
            Ok(http_request) => http_request,
            Err(e) => {
                // Never sent, so never retried; debug keeps a bad URL from flooding the log
                debug!(
                    method = %request.operation(),
                    correlation = %request.correlation(),
                    error = %e,
                    "Unable to make request, not retrying"
                );
                request.cancel();
                self.dedup.release(&request);
                return;
            }
        };

        let handler = Box::new(DispatchHandler {
            shared: Arc::clone(self),
            request: Arc::clone(&request),
        });
        // The sender may wait for capacity; shutdown must not wait with it
        tokio::select! {
            biased;
            _ = self.lifecycle.cancelled() => {
                request.cancel();
                self.dedup.release(&request);
            }
            _ = self.sender.send(http_request, handler) => {}
        }
    }

    /// `{api_url}/v2/apm/correlate/{dim}/{value}[/{type}[/{value}]]`
    pub(crate) fn build_request(&self, request: &PendingRequest) -> CorrelateResult<Request> {
        let cor = request.correlation();
        let mut url = self.api_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                CorrelateError::MalformedRequest(format!("{} cannot be a base URL", self.api_url))
            })?;
            segments
                .pop_if_empty()
                .extend(["v2", "apm", "correlate"])
                .push(&cor.dim_name)
                .push(&cor.dim_value);
            match request.operation() {
                Operation::Lookup => {}
                Operation::Upsert => {
                    segments.push(&cor.corr_type);
                }
                Operation::Delete => {
                    segments.push(&cor.corr_type).push(&cor.value);
                }
            }
        }

        let method = match request.operation() {
            Operation::Upsert => Method::PUT,
            Operation::Delete => Method::DELETE,
            Operation::Lookup => Method::GET,
        };

        let mut http_request = Request::new(method, url);
        http_request
            .headers_mut()
            .insert(HeaderName::from_static(TOKEN_HEADER), self.token_header.clone());
        if request.operation() == Operation::Upsert {
            http_request
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            *http_request.body_mut() = Some(cor.value.clone().into());
        }
        Ok(http_request)
    }

    /// Terminal outcome: report, cancel, free the dedup key
    pub(crate) fn finish(&self, request: &PendingRequest, response: RawResponse) {
        request.complete(response);
        request.cancel();
        self.dedup.release(request);
    }
}

/// Routes the sender's verdict back into the pipeline
struct DispatchHandler {
    shared: Arc<Shared>,
    request: Arc<PendingRequest>,
}

impl ResponseHandler for DispatchHandler {
    fn on_success(self: Box<Self>, body: Vec<u8>) {
        self.shared.finish(&self.request, RawResponse::success(body));
    }

    fn on_cancelled(self: Box<Self>) {
        self.request.cancel();
        self.shared.dedup.release(&self.request);
    }

    fn is_cancelled(&self) -> bool {
        self.request.is_cancelled()
    }

    fn on_failure(self: Box<Self>, response: RawResponse) {
        let retryable = response
            .error
            .as_ref()
            .is_some_and(CorrelateError::is_retryable);

        // A 4xx will not be fixed by sending the same request again
        if response.is_client_error() {
            self.shared.stats.record_client_error();
        } else if retryable {
            match self.shared.schedule_retry(&self.request) {
                Ok(()) => {
                    debug!(
                        method = %self.request.operation(),
                        correlation = %self.request.correlation(),
                        attempt = self.request.attempts(),
                        error = ?response.error,
                        "Unable to update dimension, retrying"
                    );
                    return;
                }
                Err(e) => {
                    debug!(
                        method = %self.request.operation(),
                        correlation = %self.request.correlation(),
                        reason = %e,
                        "Not retrying request"
                    );
                }
            }
        }

        self.shared.finish(&self.request, response);
    }
}
