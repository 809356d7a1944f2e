//! Per-operation dispatch: lifecycle state, statistics, and the dispatcher.

pub mod dispatcher;
pub mod state;

pub use dispatcher::{Dispatcher, Rejected};
pub use state::{DispatchSnapshot, DispatchStats, InFlightGuard, LifecycleState, StateCell};
