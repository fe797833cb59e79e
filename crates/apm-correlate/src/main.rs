//! APM Correlate - dimension correlation command-line tool
//!
//! Sends a single correlation update or lookup through the asynchronous client
//! and waits for its outcome.

use anyhow::{bail, Context};
use apm_correlate_client::{Client, Correlations};
use apm_correlate_core::{AgentConfig, ConfigLoader, Correlation, Lifecycle, StatsProvider};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "apm-correlate")]
#[command(version)]
#[command(about = "Manage APM dimension correlations", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "APM_CORRELATE_CONFIG")]
    config: Option<PathBuf>,

    /// Access token (overrides the configuration file)
    #[arg(long, global = true, env = "APM_CORRELATE_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Base URL of the correlation API
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Seconds to wait for the request to finish
    #[arg(long, global = true, default_value = "60")]
    wait_secs: u64,

    /// Print client statistics in Prometheus text format on exit
    #[arg(long, global = true)]
    stats: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Correlate a dimension with a service or environment
    Correlate {
        /// Dimension name (e.g. host)
        dim_name: String,
        /// Dimension value
        dim_value: String,
        /// Property type (service, environment)
        corr_type: String,
        /// Property value
        value: String,
    },

    /// Remove a correlation
    Delete {
        /// Dimension name (e.g. host)
        dim_name: String,
        /// Dimension value
        dim_value: String,
        /// Property type (service, environment)
        corr_type: String,
        /// Property value
        value: String,
    },

    /// Show every correlation of a dimension
    Get {
        /// Dimension name (e.g. host)
        dim_name: String,
        /// Dimension value
        dim_value: String,
    },

    /// Print the effective configuration
    Config,
}

/// Outcome delivered by a request callback
enum Outcome {
    Correlated(Arc<Correlation>),
    Deleted(Arc<Correlation>),
    Found(Correlations),
    Failed(String),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration file, then let explicit flags win
    let mut config = load_config(cli.config.clone());
    if let Some(token) = cli.token {
        config.writer.access_token = token;
    }
    if let Some(api_url) = cli.api_url {
        config.writer.api_url = api_url;
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(cli.verbose, &config.agent.log_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let wait = Duration::from_secs(cli.wait_secs);
    match cli.command {
        Commands::Correlate {
            dim_name,
            dim_value,
            corr_type,
            value,
        } => {
            let cor = Arc::new(Correlation::new(dim_name, dim_value, corr_type, value));
            run_request(&config, wait, cli.stats, |client, done| {
                client.correlate(cor, move |cor, result| {
                    let _ = done.send(match result {
                        Ok(()) => Outcome::Correlated(cor),
                        Err(e) => Outcome::Failed(e.to_string()),
                    });
                })
            })
            .await
        }
        Commands::Delete {
            dim_name,
            dim_value,
            corr_type,
            value,
        } => {
            let cor = Arc::new(Correlation::new(dim_name, dim_value, corr_type, value));
            run_request(&config, wait, cli.stats, |client, done| {
                client.delete(cor, move |cor| {
                    let _ = done.send(Outcome::Deleted(cor));
                })
            })
            .await
        }
        Commands::Get {
            dim_name,
            dim_value,
        } => {
            run_request(&config, wait, cli.stats, |client, done| {
                client.get(dim_name, dim_value, move |correlations| {
                    let _ = done.send(Outcome::Found(correlations));
                })
            })
            .await
        }
        Commands::Config => config_command(&config),
    }
}

/// Load configuration, falling back to defaults
fn load_config(cli_path: Option<PathBuf>) -> AgentConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            AgentConfig::default()
        }
    }
}

/// CLI verbose flag takes precedence, then config, then default
fn log_level(verbose: u8, configured: &str) -> Level {
    match verbose {
        0 => match configured.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Submit one request and wait for its callback, a timeout or Ctrl+C
async fn run_request<F>(
    config: &AgentConfig,
    wait: Duration,
    print_stats: bool,
    submit: F,
) -> anyhow::Result<()>
where
    F: FnOnce(&Client, oneshot::Sender<Outcome>) -> apm_correlate_client::CorrelateResult<()>,
{
    if config.writer.access_token.is_empty() {
        warn!("No access token configured, requests will likely be rejected");
    }

    let lifecycle = Lifecycle::new();
    let client = Client::new(lifecycle.clone(), &config.writer)
        .context("Failed to create correlation client")?;
    client.start();

    let (done_tx, done_rx) = oneshot::channel();
    submit(&client, done_tx).context("Request was not accepted")?;

    // The callback is dropped unrun when a request ends without a result
    let outcome = tokio::select! {
        outcome = done_rx => outcome.ok(),
        _ = tokio::time::sleep(wait) => {
            warn!("Gave up waiting after {}s", wait.as_secs());
            None
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            None
        }
    };

    lifecycle.cancel();
    client.join().await;

    if print_stats {
        print!("{}", client.stats().to_prometheus());
    }

    match outcome {
        Some(Outcome::Correlated(cor)) => println!("Correlated {}", cor),
        Some(Outcome::Deleted(cor)) => println!("Deleted {}", cor),
        Some(Outcome::Found(correlations)) => {
            println!("{}", serde_json::to_string_pretty(&correlations)?);
        }
        Some(Outcome::Failed(e)) => bail!("Request failed: {}", e),
        None => bail!("Request finished without a result (run with -v for details)"),
    }
    Ok(())
}

fn config_command(config: &AgentConfig) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(&redacted(config))
        .context("Failed to render configuration")?;
    print!("{}", rendered);
    Ok(())
}

fn redacted(config: &AgentConfig) -> AgentConfig {
    let mut config = config.clone();
    if !config.writer.access_token.is_empty() {
        config.writer.access_token = "<redacted>".to_string();
    }
    config
}
