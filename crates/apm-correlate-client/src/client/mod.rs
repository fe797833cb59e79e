//! Correlation client
//!
//! Producers call [`Client::correlate`], [`Client::delete`] and [`Client::get`]
//! from any thread. Calls never block: requests are pushed onto a bounded
//! submission queue and picked up by the dispatcher task, which drops
//! duplicates of in-flight work and hands the rest to the sender. Transient
//! failures go through the retry queue and are re-sent after a fixed delay
//! until they succeed, fail permanently, or run out of attempts.

mod dispatch;
mod retry;

pub use dispatch::TOKEN_HEADER;

use crate::dedup::Deduplicator;
use crate::error::{CorrelateError, CorrelateResult, MaxEntries};
use crate::request::{Completion, PendingRequest, RawResponse};
use crate::sender::{HttpSender, RequestSender};
use apm_correlate_core::{
    ClientStats, ConfigError, Correlation, Lifecycle, Operation, StatsProvider, StatsSnapshot,
    WriterConfig,
};
use parking_lot::Mutex;
use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use url::Url;

/// Correlations of a dimension, keyed by property type
pub type Correlations = HashMap<String, Vec<String>>;

/// State shared by the facade, both workers and in-flight response handlers
pub(crate) struct Shared {
    lifecycle: Lifecycle,
    api_url: Url,
    token_header: HeaderValue,
    sender: Arc<dyn RequestSender>,
    request_tx: mpsc::Sender<Arc<PendingRequest>>,
    retry_tx: mpsc::Sender<Arc<PendingRequest>>,
    dedup: Deduplicator,
    stats: ClientStats,
    send_delay: Duration,
    max_attempts: u32,
    log_updates: bool,
    next_id: AtomicU64,
}

type Receivers = (
    mpsc::Receiver<Arc<PendingRequest>>,
    mpsc::Receiver<Arc<PendingRequest>>,
);

/// Client for the dimension correlation API
pub struct Client {
    shared: Arc<Shared>,
    receivers: Mutex<Option<Receivers>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Create a client that sends over HTTP. Workers run until `lifecycle` is cancelled.
    pub fn new(lifecycle: Lifecycle, config: &WriterConfig) -> CorrelateResult<Self> {
        let sender = HttpSender::new(lifecycle.clone(), config)?;
        Self::with_sender(lifecycle, config, Arc::new(sender))
    }

    /// Create a client on top of a custom sender
    pub fn with_sender(
        lifecycle: Lifecycle,
        config: &WriterConfig,
        sender: Arc<dyn RequestSender>,
    ) -> CorrelateResult<Self> {
        config.validate()?;
        let api_url = config.parsed_api_url()?;

        let mut token_header = HeaderValue::from_str(&config.access_token).map_err(|_| {
            ConfigError::ValidationError("Access token is not a valid header value".to_string())
        })?;
        token_header.set_sensitive(true);

        let (request_tx, request_rx) = mpsc::channel(config.max_buffered);
        let (retry_tx, retry_rx) = mpsc::channel(config.max_buffered);

        let shared = Shared {
            lifecycle,
            api_url,
            token_header,
            sender,
            request_tx,
            retry_tx,
            dedup: Deduplicator::new(config.max_buffered),
            stats: ClientStats::new(),
            send_delay: config.send_delay(),
            max_attempts: config.max_attempts(),
            log_updates: config.log_updates,
            next_id: AtomicU64::new(0),
        };

        Ok(Self {
            shared: Arc::new(shared),
            receivers: Mutex::new(Some((request_rx, retry_rx))),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the dispatcher and the retry worker on the current tokio runtime.
    ///
    /// Calling it again is a no-op.
    pub fn start(&self) {
        let Some((request_rx, retry_rx)) = self.receivers.lock().take() else {
            return;
        };

        let dispatcher = tokio::spawn(dispatch::run(Arc::clone(&self.shared), request_rx));
        let retrier = tokio::spawn(retry::run(Arc::clone(&self.shared), retry_rx));
        self.workers.lock().extend([dispatcher, retrier]);
        debug!("Correlation client started");
    }

    /// Wait for the workers and any in-flight sends to finish after the
    /// lifecycle has been cancelled
    pub async fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Correlation worker failed: {}", e);
            }
        }
        self.shared.sender.drain().await;
    }

    /// The scope governing this client's workers
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.shared.lifecycle
    }

    /// Create or replace a correlation.
    ///
    /// `callback` runs once the update succeeds or fails for good; a full
    /// correlation set is reported as [`CorrelateError::MaxEntries`]. It never
    /// runs if the request is rejected here or dropped as a duplicate.
    pub fn correlate<F>(&self, correlation: Arc<Correlation>, callback: F) -> CorrelateResult<()>
    where
        F: FnOnce(Arc<Correlation>, CorrelateResult<()>) + Send + 'static,
    {
        let cor = Arc::clone(&correlation);
        let log_updates = self.shared.log_updates;
        self.submit(
            Operation::Upsert,
            correlation,
            Box::new(move |response: RawResponse| {
                let result = upsert_result(response);
                match &result {
                    Ok(()) if log_updates => {
                        info!(method = "PUT", correlation = %cor, "Updated dimension");
                    }
                    Ok(()) => {}
                    Err(e) => {
                        error!(
                            method = "PUT",
                            correlation = %cor,
                            error = %e,
                            "Unable to update dimension, not retrying"
                        );
                    }
                }
                callback(cor, result);
            }),
        )
    }

    /// Remove a correlation. `callback` runs only once the removal is confirmed.
    pub fn delete<F>(&self, correlation: Arc<Correlation>, callback: F) -> CorrelateResult<()>
    where
        F: FnOnce(Arc<Correlation>) + Send + 'static,
    {
        let cor = Arc::clone(&correlation);
        let log_updates = self.shared.log_updates;
        self.submit(
            Operation::Delete,
            correlation,
            Box::new(move |response: RawResponse| match response.error {
                None => {
                    if log_updates {
                        info!(method = "DELETE", correlation = %cor, "Updated dimension");
                    }
                    callback(cor);
                }
                Some(e) => {
                    error!(
                        method = "DELETE",
                        correlation = %cor,
                        error = %e,
                        "Unable to update dimension, not retrying"
                    );
                }
            }),
        )
    }

    /// Fetch every correlation of a dimension.
    ///
    /// `callback` runs only when the server answers with a well-formed body.
    /// A dimension without correlations (404) is not an error.
    pub fn get<F>(
        &self,
        dim_name: impl Into<String>,
        dim_value: impl Into<String>,
        callback: F,
    ) -> CorrelateResult<()>
    where
        F: FnOnce(Correlations) + Send + 'static,
    {
        let correlation = Arc::new(Correlation::for_dimension(dim_name, dim_value));
        let cor = Arc::clone(&correlation);
        self.submit(
            Operation::Lookup,
            correlation,
            Box::new(move |response: RawResponse| match response.error {
                None => match serde_json::from_slice::<Correlations>(&response.body) {
                    Ok(correlations) => callback(correlations),
                    Err(e) => {
                        error!(
                            dim = %cor.dim_name,
                            value = %cor.dim_value,
                            error = %e,
                            "Unable to unmarshal correlations for dimension"
                        );
                    }
                },
                // The backend answers 404 when it has nothing for the dimension
                Some(e) if response.status == Some(StatusCode::NOT_FOUND) => {
                    debug!(correlation = %cor, error = %e, "No correlations found for dimension");
                }
                Some(e) => {
                    error!(
                        correlation = %cor,
                        error = %e,
                        "Unable to retrieve correlations for dimension, not retrying"
                    );
                }
            }),
        )
    }

    /// Admit a request onto the submission queue without blocking
    fn submit(
        &self,
        operation: Operation,
        correlation: Arc<Correlation>,
        completion: Completion,
    ) -> CorrelateResult<()> {
        let shared = &self.shared;

        if !correlation.has_dimension() {
            // Debug only: nothing to correlate with, and callers may retry this often
            shared.stats.record_invalid_dimension();
            debug!(method = %operation, correlation = %correlation, "No dimension key or value to correlate to");
            return Err(CorrelateError::InvalidDimension);
        }

        let result = if shared.lifecycle.is_cancelled() {
            Err(CorrelateError::Shutdown)
        } else {
            let request = Arc::new(PendingRequest::new(
                shared.next_id.fetch_add(1, Ordering::Relaxed),
                operation,
                Arc::clone(&correlation),
                shared.lifecycle.token(),
                completion,
            ));
            match shared.request_tx.try_send(request) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(CorrelateError::QueueFull),
                Err(TrySendError::Closed(_)) => Err(CorrelateError::Shutdown),
            }
        };

        if let Err(e) = &result {
            shared.stats.record_dropped();
            debug!(
                method = %operation,
                correlation = %correlation,
                error = %e,
                "Unable to queue correlation request, not retrying"
            );
        }
        result
    }
}

impl StatsProvider for Client {
    fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

/// Interpret the outcome of an upsert; a 418 carries the server's limit
fn upsert_result(response: RawResponse) -> CorrelateResult<()> {
    if response.status == Some(StatusCode::IM_A_TEAPOT) {
        let max: MaxEntries = serde_json::from_slice(&response.body)?;
        return Err(CorrelateError::MaxEntries(max));
    }
    match response.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
