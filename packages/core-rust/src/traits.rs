//! Seams to the external message-bus client.
//!
//! The runtime never talks to a concrete bus client directly. Everything it
//! needs (connecting, publishing, advertising a service group, binding
//! endpoints) goes through these traits so the NATS adapter and the in-process
//! bus are interchangeable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::envelope::{Envelope, Headers};
use crate::error::BusError;
use crate::service::ServiceDescriptor;

/// Callback receiving every inbound envelope for one endpoint.
///
/// Called from the bus client's delivery task; must not block.
pub type EnvelopeSink = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Opens bus connections. Used once at runtime start and again whenever the
/// log forwarder needs a fresh connection.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Establish a new connection.
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BusError>;

    /// Human-readable target (URL) for diagnostics.
    fn target(&self) -> String;
}

/// A live bus connection, shared read-only between dispatchers and the log
/// forwarder.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Publish one message.
    async fn publish(&self, subject: &str, headers: Headers, payload: Bytes)
        -> Result<(), BusError>;

    /// Advertise `service` (name, version, description, metadata) on the bus.
    /// Endpoints are attached to the returned advertisement.
    async fn advertise(
        &self,
        service: &ServiceDescriptor,
    ) -> Result<Box<dyn ServiceAdvertisement>, BusError>;

    /// Release the connection. Further publishes fail with `BusError::Closed`.
    async fn close(&self) -> Result<(), BusError>;
}

/// A service group advertised on the bus.
#[async_trait]
pub trait ServiceAdvertisement: Send + Sync {
    /// Bind `operation` within `group` as a queue-group member. The subject is
    /// `<group>.<operation>`. Every inbound message is handed to `sink`.
    async fn add_endpoint(
        &mut self,
        group: &str,
        operation: &str,
        metadata: &HashMap<String, String>,
        sink: EnvelopeSink,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Withdraw the advertisement so the service is no longer discoverable.
    async fn stop(self: Box<Self>) -> Result<(), BusError>;
}

/// Handle to one bound endpoint.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Subject this subscription receives on.
    fn subject(&self) -> &str;

    /// Stop delivery. Once this returns, the sink is never called again.
    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError>;
}
