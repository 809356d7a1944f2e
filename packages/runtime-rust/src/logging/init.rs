//! Subscriber setup: local console output plus the forwarding layer.

use opbus_core::ConfigurationError;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use super::forward::{log_forwarding, LogReceiver};
use crate::error::RuntimeError;

/// How the process-wide subscriber is assembled.
#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// `EnvFilter` directives for console output, e.g. `"info,opbus_runtime=debug"`.
    pub filter: String,
    /// Emit console output as JSON lines.
    pub json: bool,
    /// Most verbose level republished on the bus.
    pub forward_level: LevelFilter,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
            forward_level: LevelFilter::TRACE,
        }
    }
}

/// Installs the global subscriber and returns the forwarding queue's
/// receiving end, to be handed to a `ServiceRuntime` or `ServiceHost`.
///
/// # Errors
///
/// Returns `RuntimeError::Configuration` for invalid filter directives and
/// `RuntimeError::Telemetry` when a global subscriber is already installed.
pub fn init_tracing(options: &TracingOptions) -> Result<LogReceiver, RuntimeError> {
    let filter = EnvFilter::try_new(&options.filter)
        .map_err(|e| ConfigurationError::InvalidSettings(format!("log filter: {e}")))?;

    let (json, plain) = if options.json {
        (Some(fmt::layer().json().with_filter(filter)), None)
    } else {
        (None, Some(fmt::layer().with_filter(filter)))
    };

    let (forwarding, receiver) = log_forwarding();

    tracing_subscriber::registry()
        .with(json)
        .with(plain)
        .with(forwarding.with_filter(options.forward_level))
        .try_init()
        .map_err(|e| RuntimeError::Telemetry(e.to_string()))?;

    Ok(receiver)
}
