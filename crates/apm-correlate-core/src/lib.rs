//! APM Correlate Core - data model, configuration and shared primitives
//!
//! This crate provides the pieces shared by the correlation client and the
//! command-line front end:
//!
//! - **Correlation**: dimension-to-property records and dedup keys
//! - **Config**: TOML/env configuration loading and validation
//! - **Lifecycle**: cooperative cancellation scopes
//! - **Stats**: atomic client counters and snapshots

pub mod config;
pub mod correlation;
pub mod lifecycle;
pub mod stats;

// Re-export commonly used types
pub use config::{
    AgentConfig, AgentSettings, ConfigError, ConfigLoader, ConfigResult, WriterConfig, MAX_CAPACITY,
};
pub use correlation::{Correlation, DedupKey, Operation};
pub use lifecycle::{Lifecycle, RequestToken};
pub use stats::{ClientStats, StatsProvider, StatsSnapshot};

/// Agent version
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
