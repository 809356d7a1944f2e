//! `opbus` core: service and operation descriptors, inbound envelopes,
//! the per-invocation operation context, and the message-bus seams.

pub mod context;
pub mod envelope;
pub mod error;
pub mod service;
pub mod traits;

pub use context::{OperationContext, DEFAULT_ERROR_CODE};
pub use envelope::{
    content_type, correlation_header, error_header, Correlation, Envelope, Headers,
};
pub use error::{BusError, ConfigurationError};
pub use service::{
    sync_handler, Concurrency, OperationDescriptor, OperationHandler, ServiceBuilder,
    ServiceDefinition, ServiceDescriptor, SyncHandler, GROUP_PREFIX, MAX_CONCURRENCY,
};
pub use traits::{BusConnection, BusConnector, EnvelopeSink, ServiceAdvertisement, Subscription};
