//! Runtime error taxonomy.

use opbus_core::{BusError, ConfigurationError};

use crate::dispatch::LifecycleState;

/// Errors that abort startup or a lifecycle call.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("failed to connect to bus at {target}")]
    Connection {
        target: String,
        #[source]
        source: BusError,
    },
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: LifecycleState,
    },
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("failed to install tracing subscriber: {0}")]
    Telemetry(String),
}

/// A handler invocation that ended without success.
///
/// Recovered locally by the dispatcher: logged, counted, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("operation {operation} of service {service} failed handling {subject}")]
    Failed {
        service: String,
        operation: String,
        subject: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("operation {operation} of service {service} panicked handling {subject}: {message}")]
    Panicked {
        service: String,
        operation: String,
        subject: String,
        message: String,
    },
}
