//! NATS adapter for the bus seams, built on the `async-nats` service API.
//!
//! A service advertisement maps onto one `async_nats::service::Service`;
//! every endpoint runs a small pump task that converts inbound requests into
//! envelopes for the sink. Replies are plain publishes to the request's reply
//! subject, so standard service errors travel as the `Nats-Service-Error`
//! headers the context sets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_nats::service::{Service, ServiceExt};
use async_nats::{ConnectOptions, Event, HeaderMap, Message};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use opbus_core::{
    BusConnection, BusConnector, BusError, Envelope, EnvelopeSink, Headers, ServiceAdvertisement,
    ServiceDescriptor, Subscription,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::config::BusSettings;

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connects to a NATS server with the configured settings.
pub struct NatsConnector {
    settings: BusSettings,
}

impl NatsConnector {
    #[must_use]
    pub fn new(settings: BusSettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }
}

#[async_trait]
impl BusConnector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BusError> {
        let mut options = ConnectOptions::new()
            .connection_timeout(self.settings.connect_timeout)
            .event_callback(|event| async move { log_connection_event(&event) });
        if let Some((user, password)) = self.settings.credentials() {
            options = options.user_and_password(user.to_string(), password.to_string());
        }

        let client = options
            .connect(self.settings.url.as_str())
            .await
            .map_err(|err| BusError::Connect {
                url: self.settings.url.clone(),
                reason: err.to_string(),
            })?;
        trace!(url = %self.settings.url, "bus connection established");

        Ok(Arc::new(NatsConnection {
            client,
            closed: AtomicBool::new(false),
        }))
    }

    fn target(&self) -> String {
        self.settings.url.clone()
    }
}

fn log_connection_event(event: &Event) {
    match event {
        Event::Connected => trace!("connected to bus"),
        Event::Disconnected => trace!("disconnected from bus"),
        Event::LameDuckMode => trace!("bus server entered lame duck mode"),
        other => trace!(event = %other, "bus connection event"),
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct NatsConnection {
    client: async_nats::Client,
    closed: AtomicBool,
}

impl NatsConnection {
    #[must_use]
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl BusConnection for NatsConnection {
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
    ) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.client
            .publish_with_headers(subject.to_string(), header_map(&headers), payload)
            .await
            .map_err(|err| BusError::Publish {
                subject: subject.to_string(),
                reason: err.to_string(),
            })
    }

    async fn advertise(
        &self,
        service: &ServiceDescriptor,
    ) -> Result<Box<dyn ServiceAdvertisement>, BusError> {
        let mut builder = self
            .client
            .service_builder()
            .metadata(service.metadata().clone());
        if !service.description().is_empty() {
            builder = builder.description(service.description());
        }
        let started = builder
            .start(service.name(), service.version())
            .await
            .map_err(|err| BusError::Service(err.to_string()))?;
        Ok(Box::new(NatsAdvertisement { service: started }))
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client
            .flush()
            .await
            .map_err(|err| BusError::Service(format!("flush on close failed: {err}")))
    }
}

// ---------------------------------------------------------------------------
// Advertisement and endpoints
// ---------------------------------------------------------------------------

struct NatsAdvertisement {
    service: Service,
}

#[async_trait]
impl ServiceAdvertisement for NatsAdvertisement {
    async fn add_endpoint(
        &mut self,
        group: &str,
        operation: &str,
        metadata: &HashMap<String, String>,
        sink: EnvelopeSink,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let subject = format!("{group}.{operation}");
        let mut endpoint = self
            .service
            .group(group)
            .endpoint_builder()
            .name(operation)
            .metadata(metadata.clone())
            .add(operation)
            .await
            .map_err(|err| BusError::Endpoint {
                subject: subject.clone(),
                reason: err.to_string(),
            })?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let pump_subject = subject.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    next = endpoint.next() => match next {
                        Some(request) => sink(envelope_from(request.message)),
                        None => break,
                    },
                }
            }
            if let Err(err) = endpoint.stop().await {
                warn!(subject = %pump_subject, error = %err, "failed to stop endpoint");
            }
        });

        Ok(Box::new(NatsSubscription {
            subject,
            stop: stop_tx,
            pump,
        }))
    }

    async fn stop(self: Box<Self>) -> Result<(), BusError> {
        self.service
            .stop()
            .await
            .map_err(|err| BusError::Service(err.to_string()))
    }
}

fn header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        map.insert(name, value);
    }
    map
}

/// Only the first value of a repeated header is kept.
fn envelope_from(message: Message) -> Envelope {
    let mut headers = Headers::new();
    if let Some(map) = &message.headers {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.as_str());
            }
        }
    }
    let envelope =
        Envelope::new(message.subject.to_string(), message.payload).with_headers(headers);
    match message.reply {
        Some(reply) => envelope.with_reply(reply.to_string()),
        None => envelope,
    }
}

struct NatsSubscription {
    subject: String,
    stop: watch::Sender<bool>,
    pump: JoinHandle<()>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        let Self {
            subject,
            stop,
            pump,
        } = *self;
        // The pump may already be gone when the service stopped first.
        let _ = stop.send(true);
        pump.await.map_err(|err| BusError::Endpoint {
            subject,
            reason: format!("endpoint pump failed: {err}"),
        })
    }
}
