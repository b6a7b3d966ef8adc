//! Logging subsystem
//!
//! Everything logs through `tracing`. [`init_logging`] installs:
//! - a console layer on stderr, scrubbed line by line
//! - the [`AuditLayer`], which redacts each event once and hands it to the
//!   [`AuditLogger`] (broadcast channel + rotating JSON-lines file)
//!
//! # Environment Variables
//!
//! - `TUNEBRIDGE_LOG` - Primary filter (takes precedence)
//! - `RUST_LOG` - Fallback filter

pub mod audit;
pub mod redact;

pub use audit::{AuditLayer, AuditLogger, LogEntry};

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use redact::RedactingMakeWriter;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// TUNEBRIDGE_LOG, then RUST_LOG, then the configured default.
fn build_env_filter(default_filter: &str) -> Result<EnvFilter> {
    let filter = std::env::var("TUNEBRIDGE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_filter.to_string());
    EnvFilter::try_new(&filter).with_context(|| format!("Invalid log filter '{}'", filter))
}

/// Human-readable console output, scrubbed line by line. Colours are off so
/// `key=value` pairs reach the scrubber intact.
fn console_layer<S, W>(make_writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(RedactingMakeWriter::new(make_writer))
}

/// Installs the global subscriber. Call once at startup.
pub fn init_logging(config: &LoggingConfig) -> Result<AuditLogger> {
    let logger = AuditLogger::new(config)?;

    let console = console_layer(std::io::stderr)
        .with_filter(build_env_filter(&config.default_filter)?);
    let audit = logger
        .layer()
        .with_filter(build_env_filter(&config.default_filter)?);

    tracing_subscriber::registry()
        .with(console)
        .with(audit)
        .try_init()
        .context("Logging already initialized")?;

    Ok(logger)
}
