//! Outbound request sender
//!
//! The pipeline hands every built request to a [`RequestSender`] together with
//! a [`ResponseHandler`]. The sender decides how many requests run at once and
//! reports the outcome through exactly one of the handler's hooks.

use crate::error::{CorrelateError, CorrelateResult};
use crate::request::RawResponse;
use apm_correlate_core::{Lifecycle, WriterConfig, AGENT_VERSION, MAX_CAPACITY};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Receives the outcome of a sent request.
///
/// The hooks consume the handler, so at most one of them can ever run.
pub trait ResponseHandler: Send {
    /// A 2xx response was received
    fn on_success(self: Box<Self>, body: Vec<u8>);

    /// The request failed, with or without a response
    fn on_failure(self: Box<Self>, response: RawResponse);

    /// The request was abandoned before it completed
    fn on_cancelled(self: Box<Self>) {}

    /// Whether the request no longer needs to be sent
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Executes built requests with bounded concurrency
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Submit a request. May wait for capacity, but never for the response.
    async fn send(&self, request: reqwest::Request, handler: Box<dyn ResponseHandler>);

    /// Wait until no request is in flight
    async fn drain(&self) {}
}

/// [`RequestSender`] backed by a pooled reqwest client.
///
/// In-flight requests are abandoned once the lifecycle is cancelled.
pub struct HttpSender {
    client: Client,
    lifecycle: Lifecycle,
    permits: Arc<Semaphore>,
    max_permits: u32,
}

impl HttpSender {
    /// Create a sender sized from the writer configuration
    pub fn new(lifecycle: Lifecycle, config: &WriterConfig) -> CorrelateResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.max_requests)
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .user_agent(format!("apm-correlate/{}", AGENT_VERSION))
            .gzip(true)
            .build()?;

        Ok(Self::with_client(lifecycle, client, config.max_requests))
    }

    /// Wrap an existing client, allowing `max_requests` requests in flight
    pub fn with_client(lifecycle: Lifecycle, client: Client, max_requests: usize) -> Self {
        let max_permits = max_requests.clamp(1, MAX_CAPACITY) as u32;
        Self {
            client,
            lifecycle,
            permits: Arc::new(Semaphore::new(max_permits as usize)),
            max_permits,
        }
    }

    /// Permits not currently held by an in-flight request
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl RequestSender for HttpSender {
    async fn send(&self, request: reqwest::Request, handler: Box<dyn ResponseHandler>) {
        let acquired = tokio::select! {
            biased;
            _ = self.lifecycle.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = acquired else {
            handler.on_cancelled();
            return;
        };

        // The wait for a permit can outlast the request
        if handler.is_cancelled() || self.lifecycle.is_cancelled() {
            handler.on_cancelled();
            return;
        }

        let client = self.client.clone();
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let method = request.method().clone();
            let url = request.url().clone();

            let executed = tokio::select! {
                biased;
                _ = lifecycle.cancelled() => None,
                executed = client.execute(request) => Some(executed),
            };
            let response = match executed {
                None => {
                    debug!(%method, %url, "Abandoning in-flight request on shutdown");
                    handler.on_cancelled();
                    return;
                }
                Some(Ok(response)) => response,
                Some(Err(e)) => {
                    debug!(%method, %url, error = %e, "Request failed without a response");
                    handler.on_failure(RawResponse::failure(
                        Vec::new(),
                        None,
                        CorrelateError::Network(e.to_string()),
                    ));
                    return;
                }
            };

            let status = response.status();
            let body = match response.bytes().await {
                Ok(body) => body.to_vec(),
                Err(e) => {
                    handler.on_failure(RawResponse::failure(
                        Vec::new(),
                        Some(status),
                        CorrelateError::Network(e.to_string()),
                    ));
                    return;
                }
            };

            if status.is_success() {
                handler.on_success(body);
            } else {
                debug!(%method, %url, %status, "Request returned an error status");
                handler.on_failure(RawResponse::failure(
                    body,
                    Some(status),
                    CorrelateError::from_status(status.as_u16()),
                ));
            }
        });
    }

    async fn drain(&self) {
        let in_flight = self.max_permits as usize - self.available();
        if in_flight > 0 {
            debug!(in_flight, "Waiting for in-flight requests");
        }
        // Every permit back in the pool means every spawned request has returned
        if let Ok(all) = self.permits.acquire_many(self.max_permits).await {
            drop(all);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::{Method, StatusCode};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug)]
    enum Outcome {
        Success(Vec<u8>),
        Failure(RawResponse),
        Cancelled,
    }

    struct ChannelHandler(mpsc::UnboundedSender<Outcome>);

    impl ResponseHandler for ChannelHandler {
        fn on_success(self: Box<Self>, body: Vec<u8>) {
            let _ = self.0.send(Outcome::Success(body));
        }

        fn on_failure(self: Box<Self>, response: RawResponse) {
            let _ = self.0.send(Outcome::Failure(response));
        }

        fn on_cancelled(self: Box<Self>) {
            let _ = self.0.send(Outcome::Cancelled);
        }
    }

    fn get(url: &str) -> reqwest::Request {
        reqwest::Request::new(Method::GET, url.parse().unwrap())
    }

    fn sender_with(lifecycle: Lifecycle, max_requests: usize) -> HttpSender {
        HttpSender::new(
            lifecycle,
            &WriterConfig {
                max_requests,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn sender() -> HttpSender {
        sender_with(Lifecycle::new(), 2)
    }

    #[tokio::test]
    async fn test_success_hook() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .expect(1)
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        sender()
            .send(get(&format!("{}/ok", server.uri())), Box::new(ChannelHandler(tx)))
            .await;

        match rx.recv().await.unwrap() {
            Outcome::Success(body) => assert_eq!(body, b"hello"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_status_failure_hook() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/teapot"))
            .respond_with(ResponseTemplate::new(418).set_body_string(r#"{"max": 3}"#))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        sender()
            .send(
                get(&format!("{}/teapot", server.uri())),
                Box::new(ChannelHandler(tx)),
            )
            .await;

        match rx.recv().await.unwrap() {
            Outcome::Failure(response) => {
                assert_eq!(response.status, Some(StatusCode::IM_A_TEAPOT));
                assert_eq!(response.body, br#"{"max": 3}"#);
                assert!(matches!(
                    response.error,
                    Some(CorrelateError::ClientError { status: 418 })
                ));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_network_failure_hook() {
        // Nothing listens on port 9 of localhost
        let (tx, mut rx) = mpsc::unbounded_channel();
        sender()
            .send(get("http://127.0.0.1:9/"), Box::new(ChannelHandler(tx)))
            .await;

        match rx.recv().await.unwrap() {
            Outcome::Failure(response) => {
                assert!(response.status.is_none());
                assert!(matches!(response.error, Some(CorrelateError::Network(_))));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permits_released_after_completion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sender = sender();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..4 {
            sender
                .send(get(&server.uri()), Box::new(ChannelHandler(tx.clone())))
                .await;
        }
        for _ in 0..4 {
            match rx.recv().await.unwrap() {
                Outcome::Failure(response) => {
                    assert!(matches!(
                        response.error,
                        Some(CorrelateError::Server { status: 500 })
                    ));
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }

        // The spawned task drops its permit right after the hook returns
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sender.available(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_lifecycle_never_sends() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let lifecycle = Lifecycle::new();
        lifecycle.cancel();
        let sender = sender_with(lifecycle, 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        sender
            .send(get(&server.uri()), Box::new(ChannelHandler(tx)))
            .await;
        assert!(matches!(rx.recv().await.unwrap(), Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_shutdown_releases_permit_waiters_and_in_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let lifecycle = Lifecycle::new();
        let sender = Arc::new(sender_with(lifecycle.clone(), 1));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // First request holds the only permit
        sender
            .send(get(&server.uri()), Box::new(ChannelHandler(tx.clone())))
            .await;
        assert_eq!(sender.available(), 0);

        let waiting = {
            let sender = sender.clone();
            let request = get(&server.uri());
            tokio::spawn(async move {
                sender.send(request, Box::new(ChannelHandler(tx))).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        lifecycle.cancel();

        tokio::time::timeout(Duration::from_secs(1), async {
            waiting.await.unwrap();
            sender.drain().await;
        })
        .await
        .expect("shutdown should not wait for the slow response");

        for _ in 0..2 {
            assert!(matches!(rx.recv().await.unwrap(), Outcome::Cancelled));
        }
        assert!(rx.recv().await.is_none());
        assert_eq!(sender.available(), 1);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;

        let sender = sender();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sender
            .send(get(&server.uri()), Box::new(ChannelHandler(tx)))
            .await;

        sender.drain().await;
        assert!(matches!(rx.try_recv(), Ok(Outcome::Success(_))));
        assert_eq!(sender.available(), 2);
    }
}
