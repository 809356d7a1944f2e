//! opbus runtime: exposes operations as bus service endpoints.
//!
//! Each operation gets a dispatcher with an unbounded FIFO queue and an
//! optional concurrency bound. `ServiceRuntime` ties one service's
//! dispatchers to a bus connection and drains them on stop; `ServiceHost`
//! runs several services together. Handler logs carrying correlation headers
//! are forwarded back onto the bus by `logging::forward`.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod logging;
pub mod runtime;

pub use config::{BusArgs, BusSettings};
pub use dispatch::{DispatchSnapshot, Dispatcher, LifecycleState, Rejected};
pub use error::{HandlerError, RuntimeError};
pub use host::ServiceHost;
pub use logging::{init_tracing, log_forwarding, LogForwarder, LogReceiver, TracingOptions};
pub use runtime::ServiceRuntime;
