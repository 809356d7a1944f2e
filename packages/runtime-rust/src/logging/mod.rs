//! Log correlation, forwarding onto the bus, and subscriber setup.

pub mod correlation;
pub mod forward;
pub mod init;

#[cfg(test)]
pub(crate) mod testing;

pub use correlation::operation_span;
pub use forward::{
    log_forwarding, log_subject, ForwardOutcome, ForwardedLog, ForwarderHandle, ForwarderStats,
    LogForwarder, LogForwardingLayer, LogReceiver,
};
pub use init::{init_tracing, TracingOptions};
