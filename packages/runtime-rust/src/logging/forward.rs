//! Republishes operation-scoped log events onto the bus.
//!
//! Two halves:
//!
//! - [`LogForwardingLayer`] is a `tracing_subscriber::Layer`. For each event
//!   that has all four correlation values in scope, it renders a compact JSON
//!   record and queues it. Events missing any value are dropped. Queuing
//!   never blocks, so a handler's log call returns immediately.
//! - [`LogForwarder`] drains the queue and publishes each record on
//!   `il.<yyyyMMdd>.<integration>.<agent>.<environment>.<correlation id>.<level>`.
//!   When a publish fails it opens one fresh connection and retries once.
//!   If the retry fails too, the record is dropped with a local diagnostic.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Local, NaiveDate, SecondsFormat, Utc};
use opbus_core::{BusConnection, BusConnector, Correlation, Headers};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{error, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::correlation::{AGENT, CORRELATION_ID, ENVIRONMENT, INTEGRATION_NAME};

/// Target of the forwarder's own diagnostics; never forwarded.
const DIAGNOSTIC_TARGET: &str = "opbus_runtime::logging::forward";

/// Root of every forwarded log subject.
pub const LOG_SUBJECT_ROOT: &str = "il";

// ---------------------------------------------------------------------------
// Subject composition
// ---------------------------------------------------------------------------

/// Level name used in forwarded subjects and records.
#[must_use]
pub fn level_name(level: Level) -> &'static str {
    match level {
        Level::TRACE => "Verbose",
        Level::DEBUG => "Debug",
        Level::INFO => "Information",
        Level::WARN => "Warning",
        Level::ERROR => "Error",
    }
}

/// Subject a log record is published on, or `None` when `correlation` is
/// missing any of its four values.
#[must_use]
pub fn log_subject(date: NaiveDate, correlation: &Correlation, level: Level) -> Option<String> {
    let Correlation {
        integration_name: Some(integration_name),
        agent: Some(agent),
        environment: Some(environment),
        correlation_id: Some(correlation_id),
    } = correlation
    else {
        return None;
    };
    Some(format!(
        "{LOG_SUBJECT_ROOT}.{}.{integration_name}.{agent}.{environment}.{correlation_id}.{}",
        date.format("%Y%m%d"),
        level_name(level),
    ))
}

// ---------------------------------------------------------------------------
// ForwardedLog
// ---------------------------------------------------------------------------

/// One rendered log record waiting to be published.
#[derive(Debug, Clone)]
pub struct ForwardedLog {
    pub subject: String,
    pub level: Level,
    pub payload: Bytes,
}

/// Creates the layer and the receiving end its records are queued on.
#[must_use]
pub fn log_forwarding() -> (LogForwardingLayer, LogReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LogForwardingLayer { tx }, LogReceiver(rx))
}

/// Receiving end of the forwarding queue. Handed to a `LogForwarder`.
#[derive(Debug)]
pub struct LogReceiver(mpsc::UnboundedReceiver<ForwardedLog>);

impl LogReceiver {
    /// Takes a queued record without waiting.
    pub fn try_recv(&mut self) -> Option<ForwardedLog> {
        self.0.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// LogForwardingLayer
// ---------------------------------------------------------------------------

/// `tracing` layer that queues correlated events for the forwarder.
#[derive(Debug, Clone)]
pub struct LogForwardingLayer {
    tx: mpsc::UnboundedSender<ForwardedLog>,
}

/// Fields recorded on a span, kept in its extensions.
#[derive(Debug, Default)]
struct SpanFields(Map<String, Value>);

impl<S> Layer<S> for LogForwardingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = SpanFields::default();
        attrs.record(&mut JsonVisitor(&mut fields.0));
        span.extensions_mut().insert(fields);
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(fields) = extensions.get_mut::<SpanFields>() {
            values.record(&mut JsonVisitor(&mut fields.0));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if event.metadata().target() == DIAGNOSTIC_TARGET || self.tx.is_closed() {
            return;
        }

        // Outermost span first so inner spans and the event override.
        let mut properties = Map::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(fields) = span.extensions().get::<SpanFields>() {
                    for (key, value) in &fields.0 {
                        properties.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        let mut event_fields = Map::new();
        event.record(&mut JsonVisitor(&mut event_fields));
        properties.extend(event_fields);

        let level = *event.metadata().level();
        let correlation = correlation_from(&properties);
        let Some(subject) = log_subject(Local::now().date_naive(), &correlation, level) else {
            return;
        };

        let record = compact_record(level, event.metadata().target(), properties);
        let payload = match serde_json::to_vec(&record) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => return,
        };
        // A closed queue means the forwarder is gone; the record is dropped.
        let _ = self.tx.send(ForwardedLog {
            subject,
            level,
            payload,
        });
    }
}

fn correlation_from(properties: &Map<String, Value>) -> Correlation {
    let get = |name: &str| properties.get(name).map(value_as_string);
    Correlation {
        integration_name: get(INTEGRATION_NAME),
        agent: get(AGENT),
        environment: get(ENVIRONMENT),
        correlation_id: get(CORRELATION_ID),
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders `@t`, `@l`, `@m`, `@x`, `target` and every remaining property.
fn compact_record(level: Level, target: &str, mut properties: Map<String, Value>) -> Value {
    let mut record = Map::new();
    record.insert(
        "@t".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    record.insert("@l".to_string(), Value::String(level_name(level).to_string()));
    if let Some(message) = properties.remove("message") {
        record.insert("@m".to_string(), message);
    }
    if let Some(error) = properties.remove("error") {
        record.insert("@x".to_string(), error);
    }
    record.insert("target".to_string(), Value::String(target.to_string()));
    for (key, value) in properties {
        record.entry(key).or_insert(value);
    }
    Value::Object(record)
}

/// Records `tracing` field values as JSON.
struct JsonVisitor<'a>(&'a mut Map<String, Value>);

impl Visit for JsonVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.0
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::String(format!("{value:?}")));
    }
}

// ---------------------------------------------------------------------------
// LogForwarder
// ---------------------------------------------------------------------------

/// Result of forwarding one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Published on the current connection.
    Delivered,
    /// First publish failed; published after reconnecting.
    Redelivered,
    /// Both attempts failed; the record was dropped.
    Dropped,
}

/// Forwarding counters.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    delivered: AtomicU64,
    reconnects: AtomicU64,
    dropped: AtomicU64,
}

impl ForwarderStats {
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Publishes queued records, reconnecting at most once per record.
///
/// Starts on the runtime's shared connection. A reconnect opens a fresh
/// connection owned by the forwarder; the shared one is never replaced or
/// closed from here.
pub struct LogForwarder {
    connection: Arc<dyn BusConnection>,
    owns_connection: bool,
    connector: Arc<dyn BusConnector>,
    stats: Arc<ForwarderStats>,
}

impl LogForwarder {
    #[must_use]
    pub fn new(shared: Arc<dyn BusConnection>, connector: Arc<dyn BusConnector>) -> Self {
        Self {
            connection: shared,
            owns_connection: false,
            connector,
            stats: Arc::new(ForwarderStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    /// Publish one record. Never returns an error: failures end in
    /// `ForwardOutcome::Dropped` plus one local diagnostic.
    pub async fn forward(&mut self, log: &ForwardedLog) -> ForwardOutcome {
        if self
            .connection
            .publish(&log.subject, Headers::new(), log.payload.clone())
            .await
            .is_ok()
        {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            return ForwardOutcome::Delivered;
        }

        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        let fresh = match self.connector.connect().await {
            Ok(fresh) => fresh,
            Err(err) => {
                self.drop_record(log, &err);
                return ForwardOutcome::Dropped;
            }
        };
        self.replace_connection(fresh).await;

        match self
            .connection
            .publish(&log.subject, Headers::new(), log.payload.clone())
            .await
        {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                ForwardOutcome::Redelivered
            }
            Err(err) => {
                self.drop_record(log, &err);
                ForwardOutcome::Dropped
            }
        }
    }

    async fn replace_connection(&mut self, fresh: Arc<dyn BusConnection>) {
        let previous = std::mem::replace(&mut self.connection, fresh);
        if self.owns_connection {
            let _ = previous.close().await;
        }
        self.owns_connection = true;
    }

    fn drop_record(&self, log: &ForwardedLog, err: &dyn std::error::Error) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        error!(
            target: DIAGNOSTIC_TARGET,
            fatal = true,
            subject = %log.subject,
            error = %err,
            "failed to write log message to bus"
        );
    }

    /// Run the forwarder on its own task until `stop` is called.
    #[must_use]
    pub fn spawn(mut self, mut receiver: LogReceiver) -> ForwarderHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stats = self.stats();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    log = receiver.0.recv() => match log {
                        Some(log) => {
                            self.forward(&log).await;
                        }
                        None => break,
                    },
                    _ = stop_rx.changed() => {
                        // Flush whatever is already queued, then exit.
                        while let Ok(log) = receiver.0.try_recv() {
                            self.forward(&log).await;
                        }
                        break;
                    }
                }
            }
            if self.owns_connection {
                let _ = self.connection.close().await;
            }
            receiver
        });

        ForwarderHandle {
            stop_tx,
            handle,
            stats,
        }
    }
}

/// Handle to a running forwarder task.
#[derive(Debug)]
pub struct ForwarderHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<LogReceiver>,
    stats: Arc<ForwarderStats>,
}

impl ForwarderHandle {
    #[must_use]
    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    /// Flush queued records and stop. Returns the receiver so forwarding can
    /// be resumed on another connection.
    pub async fn stop(self) -> Option<LogReceiver> {
        let _ = self.stop_tx.send(true);
        self.handle.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tracing::info;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::logging::correlation::operation_span;
    use crate::logging::testing::CaptureLayer;
    use opbus_core::{correlation_header, Envelope};

    fn full_correlation() -> Correlation {
        Correlation {
            integration_name: Some("orders".to_string()),
            agent: Some("agent-7".to_string()),
            environment: Some("prod".to_string()),
            correlation_id: Some("c-42".to_string()),
        }
    }

    fn correlated_envelope(correlation: &Correlation) -> Envelope {
        let mut headers = Headers::new();
        correlation.apply_to(&mut headers);
        Envelope::new("external.svc.op", "payload").with_headers(headers)
    }

    fn sample_log() -> ForwardedLog {
        ForwardedLog {
            subject: "il.20240101.orders.agent-7.prod.c-42.Information".to_string(),
            level: Level::INFO,
            payload: Bytes::from_static(b"{}"),
        }
    }

    #[test]
    fn subject_format_is_exact() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let subject = log_subject(date, &full_correlation(), Level::WARN).unwrap();
        assert_eq!(subject, "il.20240309.orders.agent-7.prod.c-42.Warning");
    }

    #[test]
    fn subject_requires_all_four_values() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let mut correlation = full_correlation();
        correlation.environment = None;
        assert!(log_subject(date, &correlation, Level::INFO).is_none());
    }

    #[test]
    fn level_names() {
        assert_eq!(level_name(Level::TRACE), "Verbose");
        assert_eq!(level_name(Level::INFO), "Information");
        assert_eq!(level_name(Level::ERROR), "Error");
    }

    #[test]
    fn layer_forwards_correlated_event_with_compact_record() {
        let (layer, mut rx) = log_forwarding();
        let subscriber = tracing_subscriber::registry().with(layer);
        let envelope = correlated_envelope(&full_correlation());

        tracing::subscriber::with_default(subscriber, || {
            let span = operation_span("svc", "op", &envelope);
            span.in_scope(|| info!(data = "World", "processing incoming message"));
        });

        let log = rx.try_recv().expect("event should be forwarded");
        let today = Local::now().date_naive().format("%Y%m%d").to_string();
        assert_eq!(
            log.subject,
            format!("il.{today}.orders.agent-7.prod.c-42.Information")
        );
        let record: Value = serde_json::from_slice(&log.payload).unwrap();
        assert_eq!(record["@l"], "Information");
        assert_eq!(record["@m"], "processing incoming message");
        assert_eq!(record["data"], "World");
        assert_eq!(record["operation"], "op");
        assert_eq!(record[CORRELATION_ID], "c-42");
        assert!(record["@t"].is_string());
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn layer_ignores_events_outside_operation_spans() {
        let (layer, mut rx) = log_forwarding();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            info!("service starting");
        });
        assert!(rx.try_recv().is_none());
    }

    proptest! {
        /// Forwarded events are exactly those with all four values in scope.
        #[test]
        fn forwards_only_fully_correlated_events(
            integration in proptest::option::of("[a-z]{1,8}"),
            agent in proptest::option::of("[a-z0-9]{1,8}"),
            environment in proptest::option::of("[a-z]{1,5}"),
            correlation_id in proptest::option::of("[a-f0-9]{1,12}"),
        ) {
            let correlation = Correlation {
                integration_name: integration,
                agent,
                environment,
                correlation_id,
            };
            let mut headers = Headers::new();
            correlation.apply_to(&mut headers);
            let envelope = Envelope::new("external.svc.op", "").with_headers(headers);

            let (layer, mut rx) = log_forwarding();
            let subscriber = tracing_subscriber::registry().with(layer);
            tracing::subscriber::with_default(subscriber, || {
                let span = operation_span("svc", "op", &envelope);
                span.in_scope(|| info!("handled"));
            });

            prop_assert_eq!(rx.try_recv().is_some(), correlation.is_complete());
        }
    }

    #[tokio::test]
    async fn delivers_on_healthy_connection() {
        let bus = MemoryBus::new();
        let shared = bus.connect_memory();
        let mut forwarder = LogForwarder::new(shared, Arc::new(bus.connector()));

        assert_eq!(forwarder.forward(&sample_log()).await, ForwardOutcome::Delivered);
        assert_eq!(bus.published_to(&sample_log().subject).len(), 1);
    }

    #[tokio::test]
    async fn reconnects_once_when_connection_severed() {
        let bus = MemoryBus::new();
        let shared = bus.connect_memory();
        shared.sever();
        let connector = Arc::new(bus.connector());
        let mut forwarder = LogForwarder::new(shared.clone(), connector.clone());

        let outcome = forwarder.forward(&sample_log()).await;

        assert_eq!(outcome, ForwardOutcome::Redelivered);
        assert_eq!(bus.published_to(&sample_log().subject).len(), 1);
        assert_eq!(connector.connect_count(), 1);
        // The shared connection is left as it was.
        assert!(shared.is_severed());
        assert!(!shared.is_closed());
    }

    #[tokio::test]
    async fn drops_with_one_diagnostic_when_retry_fails() {
        let capture = CaptureLayer::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let bus = MemoryBus::new();
        let shared = bus.connect_memory();
        shared.sever();
        bus.sever_new_connections(true);
        let connector = Arc::new(bus.connector());
        let mut forwarder = LogForwarder::new(shared, connector.clone());

        let outcome = forwarder.forward(&sample_log()).await;

        assert_eq!(outcome, ForwardOutcome::Dropped);
        assert!(bus.published_to(&sample_log().subject).is_empty());
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(forwarder.stats().dropped(), 1);
        let fatal: Vec<_> = capture
            .events()
            .into_iter()
            .filter(|e| {
                e.level == Level::ERROR && e.fields.get("fatal").map(String::as_str) == Some("true")
            })
            .collect();
        assert_eq!(fatal.len(), 1);
    }

    #[tokio::test]
    async fn drops_when_reconnect_refused() {
        let bus = MemoryBus::new();
        let shared = bus.connect_memory();
        shared.sever();
        bus.refuse_connects(true);
        let mut forwarder = LogForwarder::new(shared, Arc::new(bus.connector()));

        assert_eq!(forwarder.forward(&sample_log()).await, ForwardOutcome::Dropped);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn spawned_forwarder_flushes_on_stop() {
        let bus = MemoryBus::new();
        let (layer, rx) = log_forwarding();
        let forwarder = LogForwarder::new(bus.connect_memory(), Arc::new(bus.connector()));
        let handle = forwarder.spawn(rx);

        let subscriber = tracing_subscriber::registry().with(layer);
        let mut headers = Headers::new();
        full_correlation().apply_to(&mut headers);
        headers.insert(correlation_header::CORRELATION_ID, "flush-1");
        let envelope = Envelope::new("external.svc.op", "").with_headers(headers);
        tracing::subscriber::with_default(subscriber, || {
            let span = operation_span("svc", "op", &envelope);
            span.in_scope(|| info!("first"));
            span.in_scope(|| info!("second"));
        });

        let stats = handle.stats();
        assert!(handle.stop().await.is_some());
        assert_eq!(stats.delivered(), 2);
        assert_eq!(bus.published_matching(".flush-1.Information").len(), 2);
    }
}
