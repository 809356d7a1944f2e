//! In-process bus implementing the bus seams.
//!
//! Behaves like a single bus server shared by every connection made from the
//! same `MemoryBus`: publishes reach bound endpoints (one queue-group member
//! each, round robin) or request inboxes, and every publish is recorded so
//! tests can inspect traffic. Fault injection covers the failure paths:
//! refused connects, severed connections, and connections born severed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use opbus_core::{
    BusConnection, BusConnector, BusError, Envelope, EnvelopeSink, Headers, ServiceAdvertisement,
    ServiceDescriptor, Subscription,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;

const MEMORY_URL: &str = "memory://local";

/// A service as currently advertised on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedService {
    pub name: String,
    pub version: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
    /// Subjects of the endpoints bound under this advertisement.
    pub endpoints: Vec<String>,
}

/// Queue-group members bound to one subject.
#[derive(Default)]
struct EndpointSlot {
    members: Vec<(u64, EnvelopeSink)>,
    next: usize,
}

#[derive(Default)]
struct Hub {
    endpoints: DashMap<String, EndpointSlot>,
    inboxes: DashMap<String, oneshot::Sender<Envelope>>,
    services: DashMap<u64, AdvertisedService>,
    published: Mutex<Vec<Envelope>>,
    refuse_connects: AtomicBool,
    sever_new_connections: AtomicBool,
    next_id: AtomicU64,
}

impl Hub {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Record and route one message.
    fn route(&self, envelope: Envelope) {
        self.published.lock().push(envelope.clone());

        if let Some((_, waiter)) = self.inboxes.remove(&envelope.subject) {
            let _ = waiter.send(envelope);
            return;
        }

        // The sink runs under the slot's lock so an unsubscribe that has
        // returned can never race a delivery.
        if let Some(mut slot) = self.endpoints.get_mut(&envelope.subject) {
            if slot.members.is_empty() {
                return;
            }
            let index = slot.next % slot.members.len();
            slot.next = slot.next.wrapping_add(1);
            (slot.members[index].1)(envelope);
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

/// Shared in-process bus. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    hub: Arc<Hub>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector producing connections to this bus.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            bus: self.clone(),
            connects: AtomicUsize::new(0),
        }
    }

    /// Open a connection directly, bypassing fault injection on connects.
    #[must_use]
    pub fn connect_memory(&self) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            bus: self.clone(),
            closed: AtomicBool::new(false),
            severed: AtomicBool::new(self.hub.sever_new_connections.load(Ordering::SeqCst)),
        })
    }

    /// Make every following connect attempt fail.
    pub fn refuse_connects(&self, refuse: bool) {
        self.hub.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// Make every following connection start out severed.
    pub fn sever_new_connections(&self, sever: bool) {
        self.hub.sever_new_connections.store(sever, Ordering::SeqCst);
    }

    /// Publish from outside any connection.
    pub fn publish(&self, subject: &str, headers: Headers, payload: impl Into<Bytes>) {
        let envelope = Envelope::new(subject, payload).with_headers(headers);
        self.hub.route(envelope);
    }

    /// Send a request and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Timeout` when no reply arrives within `timeout`.
    pub async fn request(
        &self,
        subject: &str,
        headers: Headers,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Envelope, BusError> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        self.hub.inboxes.insert(inbox.clone(), tx);

        let envelope = Envelope::new(subject, payload)
            .with_reply(inbox.clone())
            .with_headers(headers);
        self.hub.route(envelope);

        let result = tokio::time::timeout(timeout, rx).await;
        self.hub.inboxes.remove(&inbox);
        match result {
            Ok(Ok(reply)) => Ok(reply),
            _ => Err(BusError::Timeout {
                subject: subject.to_string(),
            }),
        }
    }

    /// Every message published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<Envelope> {
        self.hub.published.lock().clone()
    }

    /// Published messages whose subject equals `subject`.
    #[must_use]
    pub fn published_to(&self, subject: &str) -> Vec<Envelope> {
        self.published()
            .into_iter()
            .filter(|e| e.subject == subject)
            .collect()
    }

    /// Published messages whose subject contains `fragment`.
    #[must_use]
    pub fn published_matching(&self, fragment: &str) -> Vec<Envelope> {
        self.published()
            .into_iter()
            .filter(|e| e.subject.contains(fragment))
            .collect()
    }

    /// Services currently advertised.
    #[must_use]
    pub fn advertised(&self) -> Vec<AdvertisedService> {
        let mut services: Vec<_> = self
            .hub
            .services
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        services.sort_by_key(|(id, _)| *id);
        services.into_iter().map(|(_, s)| s).collect()
    }

    /// Whether any endpoint is bound to `subject`.
    #[must_use]
    pub fn has_endpoint(&self, subject: &str) -> bool {
        self.hub
            .endpoints
            .get(subject)
            .is_some_and(|slot| !slot.members.is_empty())
    }
}

// ---------------------------------------------------------------------------
// MemoryConnector
// ---------------------------------------------------------------------------

/// Connector for a `MemoryBus`; counts connect attempts.
pub struct MemoryConnector {
    bus: MemoryBus,
    connects: AtomicUsize,
}

impl MemoryConnector {
    /// Number of connect attempts, successful or not.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BusError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.bus.hub.refuse_connects.load(Ordering::SeqCst) {
            return Err(BusError::Connect {
                url: MEMORY_URL.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.bus.connect_memory())
    }

    fn target(&self) -> String {
        MEMORY_URL.to_string()
    }
}

// ---------------------------------------------------------------------------
// MemoryConnection
// ---------------------------------------------------------------------------

/// One connection to a `MemoryBus`.
pub struct MemoryConnection {
    bus: MemoryBus,
    closed: AtomicBool,
    severed: AtomicBool,
}

impl MemoryConnection {
    /// Simulate a dropped link: every publish fails until `restore`.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.severed.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
    ) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if self.is_severed() {
            return Err(BusError::Publish {
                subject: subject.to_string(),
                reason: "connection severed".to_string(),
            });
        }
        self.bus
            .hub
            .route(Envelope::new(subject, payload).with_headers(headers));
        Ok(())
    }

    async fn advertise(
        &self,
        service: &ServiceDescriptor,
    ) -> Result<Box<dyn ServiceAdvertisement>, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let id = self.bus.hub.next_id();
        self.bus.hub.services.insert(
            id,
            AdvertisedService {
                name: service.name().to_string(),
                version: service.version().to_string(),
                description: service.description().to_string(),
                metadata: service.metadata().clone(),
                endpoints: Vec::new(),
            },
        );
        Ok(Box::new(MemoryAdvertisement {
            bus: self.bus.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryAdvertisement / MemorySubscription
// ---------------------------------------------------------------------------

struct MemoryAdvertisement {
    bus: MemoryBus,
    id: u64,
}

#[async_trait]
impl ServiceAdvertisement for MemoryAdvertisement {
    async fn add_endpoint(
        &mut self,
        group: &str,
        operation: &str,
        _metadata: &HashMap<String, String>,
        sink: EnvelopeSink,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let subject = format!("{group}.{operation}");
        let member = self.bus.hub.next_id();
        self.bus
            .hub
            .endpoints
            .entry(subject.clone())
            .or_default()
            .members
            .push((member, sink));
        if let Some(mut service) = self.bus.hub.services.get_mut(&self.id) {
            service.endpoints.push(subject.clone());
        }
        Ok(Box::new(MemorySubscription {
            bus: self.bus.clone(),
            subject,
            member,
        }))
    }

    async fn stop(self: Box<Self>) -> Result<(), BusError> {
        self.bus.hub.services.remove(&self.id);
        Ok(())
    }
}

struct MemorySubscription {
    bus: MemoryBus,
    subject: String,
    member: u64,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        if let Some(mut slot) = self.bus.hub.endpoints.get_mut(&self.subject) {
            slot.members.retain(|(id, _)| *id != self.member);
        }
        Ok(())
    }
}
