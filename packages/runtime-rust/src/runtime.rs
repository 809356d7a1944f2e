//! Lifecycle of one service on the bus.
//!
//! Start: connect, advertise the service, then create, start and bind one
//! dispatcher per operation. Stop runs the same steps backwards and in a
//! fixed order: withdraw the advertisement, unsubscribe every endpoint, drain
//! every dispatcher, stop log forwarding, and only then close the connection.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use opbus_core::{
    BusConnection, BusConnector, BusError, EnvelopeSink, OperationDescriptor,
    ServiceAdvertisement, ServiceDescriptor, Subscription,
};
use tracing::{error, info, warn};

use crate::dispatch::{DispatchSnapshot, Dispatcher, LifecycleState};
use crate::error::RuntimeError;
use crate::logging::{ForwarderHandle, LogForwarder, LogReceiver};

/// Everything that only exists while the service is running.
struct Running {
    connection: Arc<dyn BusConnection>,
    advertisement: Option<Box<dyn ServiceAdvertisement>>,
    subscriptions: Vec<Box<dyn Subscription>>,
    dispatchers: Vec<Arc<Dispatcher>>,
    forwarder: Option<ForwarderHandle>,
}

/// Runs one service: owns its bus connection and its dispatchers.
pub struct ServiceRuntime {
    descriptor: ServiceDescriptor,
    connector: Arc<dyn BusConnector>,
    state: LifecycleState,
    log_receiver: Option<LogReceiver>,
    dispatchers: Vec<Arc<Dispatcher>>,
    running: Option<Running>,
}

impl ServiceRuntime {
    #[must_use]
    pub fn new(descriptor: ServiceDescriptor, connector: Arc<dyn BusConnector>) -> Self {
        Self {
            descriptor,
            connector,
            state: LifecycleState::Created,
            log_receiver: None,
            dispatchers: Vec::new(),
            running: None,
        }
    }

    /// Forward correlated log records over this service's connection while it
    /// runs.
    #[must_use]
    pub fn with_log_forwarding(mut self, receiver: LogReceiver) -> Self {
        self.log_receiver = Some(receiver);
        self
    }

    pub(crate) fn set_log_forwarding(&mut self, receiver: LogReceiver) {
        self.log_receiver = Some(receiver);
    }

    #[must_use]
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Statistics of the named operation's dispatcher, once started.
    #[must_use]
    pub fn stats(&self, operation: &str) -> Option<DispatchSnapshot> {
        self.dispatchers
            .iter()
            .find(|d| d.operation() == operation)
            .map(|d| d.stats())
    }

    /// Statistics of every dispatcher, in registration order.
    #[must_use]
    pub fn dispatcher_stats(&self) -> Vec<(String, DispatchSnapshot)> {
        self.dispatchers
            .iter()
            .map(|d| (d.operation().to_string(), d.stats()))
            .collect()
    }

    /// Connect, advertise, and start serving every operation.
    ///
    /// # Errors
    ///
    /// - `RuntimeError::InvalidState` unless the runtime is `Created`.
    /// - `RuntimeError::Connection` when the bus cannot be reached. There is
    ///   no retry; the runtime ends up `Stopped`.
    /// - `RuntimeError::Bus` when advertising or binding fails; everything
    ///   already set up is torn down again.
    pub async fn start(&mut self) -> Result<(), RuntimeError> {
        if self.state != LifecycleState::Created {
            return Err(RuntimeError::InvalidState {
                action: "start service",
                state: self.state,
            });
        }

        let name = self.descriptor.name().to_string();
        info!(
            service = %name,
            version = %self.descriptor.version(),
            operations = self.descriptor.operations().len(),
            "starting service"
        );

        let connection = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(source) => {
                let target = self.connector.target();
                error!(
                    service = %name,
                    target = %target,
                    error = %source,
                    "failed to connect to bus"
                );
                self.state = LifecycleState::Stopped;
                return Err(RuntimeError::Connection { target, source });
            }
        };

        let advertisement = match connection.advertise(&self.descriptor).await {
            Ok(advertisement) => advertisement,
            Err(err) => {
                let _ = connection.close().await;
                self.state = LifecycleState::Stopped;
                return Err(err.into());
            }
        };

        let mut running = Running {
            connection,
            advertisement: Some(advertisement),
            subscriptions: Vec::new(),
            dispatchers: Vec::new(),
            forwarder: None,
        };

        let group = self.descriptor.group();
        for operation in self.descriptor.operations() {
            if let Err(err) = running.bind(&name, &group, operation).await {
                error!(
                    service = %name,
                    operation = %operation.name(),
                    error = %err,
                    "failed to bind operation"
                );
                self.dispatchers.clone_from(&running.dispatchers);
                let _ = running.shutdown(&name).await;
                self.state = LifecycleState::Stopped;
                return Err(err);
            }
        }

        if let Some(receiver) = self.log_receiver.take() {
            let forwarder =
                LogForwarder::new(Arc::clone(&running.connection), Arc::clone(&self.connector));
            running.forwarder = Some(forwarder.spawn(receiver));
        }

        self.dispatchers.clone_from(&running.dispatchers);
        self.running = Some(running);
        self.state = LifecycleState::Running;
        info!(service = %name, "service started");
        Ok(())
    }

    /// Stop serving and release the connection. Returns once every
    /// dispatcher has drained.
    ///
    /// Teardown always runs to completion; the first bus error met on the way
    /// is returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Bus` when withdrawing, unsubscribing or closing
    /// failed.
    pub async fn stop(&mut self) -> Result<(), RuntimeError> {
        let Some(running) = self.running.take() else {
            self.state = LifecycleState::Stopped;
            return Ok(());
        };
        self.state = LifecycleState::Draining;
        let name = self.descriptor.name().to_string();
        info!(service = %name, "stopping service");

        let result = running.shutdown(&name).await;
        self.state = LifecycleState::Stopped;
        info!(service = %name, "service stopped");
        result.map_err(RuntimeError::from)
    }

    /// Start, serve until `shutdown` resolves, then stop.
    ///
    /// # Errors
    ///
    /// Propagates start and stop errors.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), RuntimeError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }
}

impl Running {
    /// Create, start and bind the dispatcher for one operation.
    async fn bind(
        &mut self,
        service: &str,
        group: &str,
        operation: &OperationDescriptor,
    ) -> Result<(), RuntimeError> {
        let dispatcher = Arc::new(Dispatcher::new(
            service,
            operation,
            Arc::clone(&self.connection),
        ));
        dispatcher.start()?;
        self.dispatchers.push(Arc::clone(&dispatcher));

        let target = Arc::clone(&dispatcher);
        let sink: EnvelopeSink = Arc::new(move |envelope| {
            if let Err(rejected) = target.admit(envelope) {
                warn!(
                    operation = %target.operation(),
                    subject = %rejected.envelope.subject,
                    state = %rejected.state,
                    "envelope rejected by dispatcher"
                );
            }
        });

        let Some(advertisement) = self.advertisement.as_mut() else {
            return Err(RuntimeError::InvalidState {
                action: "bind operation",
                state: LifecycleState::Draining,
            });
        };
        let subscription = advertisement
            .add_endpoint(group, operation.name(), operation.metadata(), sink)
            .await?;
        self.subscriptions.push(subscription);
        Ok(())
    }

    /// Ordered teardown: advertisement, subscriptions, dispatchers, log
    /// forwarding, connection.
    async fn shutdown(self, service: &str) -> Result<(), BusError> {
        let Running {
            connection,
            advertisement,
            subscriptions,
            dispatchers,
            forwarder,
        } = self;
        let mut first_error: Option<BusError> = None;
        let mut note = |step: &str, err: BusError| {
            warn!(service = %service, step, error = %err, "service teardown step failed");
            first_error.get_or_insert(err);
        };

        if let Some(advertisement) = advertisement {
            if let Err(err) = advertisement.stop().await {
                note("withdraw advertisement", err);
            }
        }

        for subscription in subscriptions {
            if let Err(err) = subscription.unsubscribe().await {
                note("unsubscribe", err);
            }
        }

        let drained = join_all(dispatchers.iter().map(|d| d.stop())).await;
        for (dispatcher, result) in dispatchers.iter().zip(drained) {
            if let Err(err) = result {
                error!(
                    service = %service,
                    operation = %dispatcher.operation(),
                    error = %err,
                    "dispatcher failed to drain"
                );
            }
        }

        if let Some(forwarder) = forwarder {
            forwarder.stop().await;
        }

        if let Err(err) = connection.close().await {
            note("close connection", err);
        }

        first_error.map_or(Ok(()), Err)
    }
}
