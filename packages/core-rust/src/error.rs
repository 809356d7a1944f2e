//! Error types shared by the core and runtime crates.

/// Malformed service or operation registration.
///
/// Raised synchronously while building a `ServiceDescriptor`; never raised by
/// a running service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("operation name must not be empty")]
    EmptyOperationName,
    #[error("service name must not be empty")]
    MissingServiceName,
    #[error("operation concurrency bound must be at least 1")]
    ZeroConcurrency,
    #[error("operation concurrency bound {limit} exceeds the maximum of {max}")]
    ConcurrencyTooLarge { limit: usize, max: usize },
    #[error("service {service} must declare a version")]
    MissingServiceVersion { service: String },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// Failures reported by a bus client implementation.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("failed to publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },
    #[error("failed to register endpoint {subject}: {reason}")]
    Endpoint { subject: String, reason: String },
    #[error("service advertisement failed: {0}")]
    Service(String),
    #[error("request to {subject} timed out")]
    Timeout { subject: String },
    #[error("message on {subject} has no reply subject")]
    NoReplySubject { subject: String },
    #[error("connection is closed")]
    Closed,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}
