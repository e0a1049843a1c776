//! # gpuscope-agent
//!
//! Node agent (gpuscoped daemon) for gpuscope.
//!
//! This crate wires the device inventory, watch-lists, collectors, and the
//! transformation pipeline into a running exporter: the scrape server, the
//! config and GPU topology watchers, and the reload coordinator that swaps
//! registries without interrupting in-flight scrapes.

pub mod agent;
pub mod cli;
pub mod dump;
pub mod reload;
pub mod server;
pub mod watchers;

pub use agent::Agent;
pub use cli::Cli;
pub use reload::ReloadCoordinator;
pub use server::MetricsServer;

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] gpuscope_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Initialize logging and tracing from the CLI selection.
pub fn init_logging(log_format: &str, debug: bool) -> Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match log_format {
        "text" => subscriber.init(),
        "json" => subscriber.json().init(),
        other => {
            return Err(AgentError::Config(format!("invalid log-format value: {}", other)));
        }
    }

    if debug {
        tracing::debug!("debug output is enabled");
    }
    Ok(())
}
