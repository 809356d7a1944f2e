//! Several services in one process.
//!
//! Services start in registration order and stop in reverse, each with its
//! own bus connection. Log forwarding, when configured, rides on the first
//! service's connection.

use std::future::Future;
use std::sync::Arc;

use opbus_core::{BusConnector, ServiceDescriptor};
use tracing::{error, info};

use crate::error::RuntimeError;
use crate::logging::LogReceiver;
use crate::runtime::ServiceRuntime;

pub struct ServiceHost {
    connector: Arc<dyn BusConnector>,
    runtimes: Vec<ServiceRuntime>,
    log_receiver: Option<LogReceiver>,
}

impl ServiceHost {
    #[must_use]
    pub fn new(connector: Arc<dyn BusConnector>) -> Self {
        Self {
            connector,
            runtimes: Vec::new(),
            log_receiver: None,
        }
    }

    /// Register a service. Registration order is start order.
    #[must_use]
    pub fn with_service(mut self, descriptor: ServiceDescriptor) -> Self {
        self.runtimes
            .push(ServiceRuntime::new(descriptor, Arc::clone(&self.connector)));
        self
    }

    #[must_use]
    pub fn with_log_forwarding(mut self, receiver: LogReceiver) -> Self {
        self.log_receiver = Some(receiver);
        self
    }

    #[must_use]
    pub fn services(&self) -> &[ServiceRuntime] {
        &self.runtimes
    }

    /// Start every service in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first start error; services already started are stopped
    /// again, in reverse, before it is returned.
    pub async fn start(&mut self) -> Result<(), RuntimeError> {
        if let Some(receiver) = self.log_receiver.take() {
            if let Some(first) = self.runtimes.first_mut() {
                first.set_log_forwarding(receiver);
            }
        }

        for index in 0..self.runtimes.len() {
            if let Err(err) = self.runtimes[index].start().await {
                error!(
                    service = %self.runtimes[index].descriptor().name(),
                    error = %err,
                    "service failed to start, stopping the ones already running"
                );
                for started in self.runtimes[..index].iter_mut().rev() {
                    let _ = started.stop().await;
                }
                return Err(err);
            }
        }
        info!(services = self.runtimes.len(), "all services started");
        Ok(())
    }

    /// Stop every service in reverse registration order.
    ///
    /// # Errors
    ///
    /// Every service is stopped regardless; the first error is returned.
    pub async fn stop(&mut self) -> Result<(), RuntimeError> {
        let mut first_error = None;
        for runtime in self.runtimes.iter_mut().rev() {
            if let Err(err) = runtime.stop().await {
                error!(
                    service = %runtime.descriptor().name(),
                    error = %err,
                    "service failed to stop cleanly"
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
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
        info!("shutdown requested");
        self.stop().await
    }

    /// Start and serve until ctrl-c.
    ///
    /// # Errors
    ///
    /// Propagates start and stop errors.
    pub async fn run(self) -> Result<(), RuntimeError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c, stopping");
            }
        })
        .await
    }
}
