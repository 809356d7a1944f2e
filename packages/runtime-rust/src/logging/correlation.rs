//! Per-invocation log span carrying an envelope's correlation values.

use opbus_core::Envelope;
use tracing::field;

/// Span field holding the integration name.
pub const INTEGRATION_NAME: &str = "integration_name";
/// Span field holding the agent identity.
pub const AGENT: &str = "agent";
/// Span field holding the environment.
pub const ENVIRONMENT: &str = "environment";
/// Span field holding the correlation id.
pub const CORRELATION_ID: &str = "correlation_id";

/// Build the span a handler invocation runs in.
///
/// Correlation values present in the envelope's headers are recorded on the
/// span; absent ones stay empty, so nothing below the span inherits them.
/// `duration_ms` and `outcome` are filled in by the dispatcher once the
/// handler has finished.
/// Each invocation gets its own span, so concurrently running handlers never
/// see each other's values.
#[must_use]
pub fn operation_span(service: &str, operation: &str, envelope: &Envelope) -> tracing::Span {
    let span = tracing::info_span!(
        "operation",
        service = %service,
        operation = %operation,
        subject = %envelope.subject,
        integration_name = field::Empty,
        agent = field::Empty,
        environment = field::Empty,
        correlation_id = field::Empty,
        duration_ms = field::Empty,
        outcome = field::Empty,
    );

    let correlation = envelope.correlation();
    let values = [
        (INTEGRATION_NAME, correlation.integration_name),
        (AGENT, correlation.agent),
        (ENVIRONMENT, correlation.environment),
        (CORRELATION_ID, correlation.correlation_id),
    ];
    for (name, value) in values {
        if let Some(value) = value {
            span.record(name, value.as_str());
        }
    }
    span
}
