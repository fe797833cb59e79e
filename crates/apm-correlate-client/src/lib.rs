//! APM Correlate Client - asynchronous dimension correlation updates
//!
//! This crate keeps dimension-to-service/environment correlations in sync with
//! the backend correlation API.
//!
//! ## Features
//!
//! - **Non-blocking submission** - producers never wait; a full queue rejects the request
//! - **Deduplication** - a request is dropped while an equivalent one is in flight
//! - **Retries** - transient failures are re-sent after a fixed delay, a bounded number of times
//! - **Cancellation** - per-request tokens derived from a client-wide lifecycle
//! - **Statistics** - atomic counters for errors, retries and drops
//!
//! ## Quick Start
//!
//! ```no_run
//! use apm_correlate_client::Client;
//! use apm_correlate_core::{Correlation, Lifecycle, WriterConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WriterConfig {
//!         access_token: "my-token".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let lifecycle = Lifecycle::new();
//!     let client = Client::new(lifecycle.clone(), &config)?;
//!     client.start();
//!
//!     let cor = Arc::new(Correlation::new("host", "web-1", "service", "checkout"));
//!     client.correlate(cor, |cor, result| {
//!         println!("{}: {:?}", cor, result);
//!     })?;
//!
//!     lifecycle.cancel();
//!     client.join().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod dedup;
pub mod error;
pub mod request;
pub mod sender;

// Re-exports for convenience
pub use client::{Client, Correlations, TOKEN_HEADER};
pub use dedup::Deduplicator;
pub use error::{CorrelateError, CorrelateResult, MaxEntries};
pub use request::{PendingRequest, RawResponse};
pub use sender::{HttpSender, RequestSender, ResponseHandler};
