//! Bus adapters: the in-process bus used by tests and local runs, and the
//! NATS adapter used in production.

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::{AdvertisedService, MemoryBus, MemoryConnection, MemoryConnector};
#[cfg(feature = "nats")]
pub use nats::{NatsConnection, NatsConnector};
