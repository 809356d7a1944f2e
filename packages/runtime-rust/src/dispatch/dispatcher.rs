//! Per-operation admission and execution engine.
//!
//! Each dispatcher owns an unbounded FIFO queue and one worker task. The
//! worker takes envelopes in arrival order, waits for a concurrency permit
//! when the operation is bounded, and runs each invocation on its own task.
//! Handler failures (errors and panics) are logged and counted; they never
//! escape the invocation task.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use opbus_core::{
    BusConnection, Concurrency, Envelope, OperationContext, OperationDescriptor, OperationHandler,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, Instrument};

use super::state::{DispatchSnapshot, DispatchStats, LifecycleState, StateCell};
use crate::error::{HandlerError, RuntimeError};
use crate::logging::correlation::operation_span;

/// Reason an envelope was not admitted.
#[derive(Debug)]
pub struct Rejected {
    pub envelope: Envelope,
    pub state: LifecycleState,
}

// ---------------------------------------------------------------------------
// Invoker
// ---------------------------------------------------------------------------

/// Everything an invocation task needs; shared by all of them.
struct Invoker {
    service: Arc<str>,
    operation: Arc<str>,
    handler: Arc<dyn OperationHandler>,
    connection: Arc<dyn BusConnection>,
    stats: Arc<DispatchStats>,
}

impl Invoker {
    /// Run one handler invocation to its terminal outcome.
    ///
    /// `_permit` is held until the invocation finishes, after the in-flight
    /// guard is released.
    async fn invoke(self: Arc<Self>, envelope: Envelope, _permit: Option<OwnedSemaphorePermit>) {
        let _in_flight = self.stats.in_flight_guard();
        let subject = envelope.subject.clone();

        debug!(
            operation = %self.operation,
            service = %self.service,
            subject = %subject,
            "operation is handling request"
        );

        let span = operation_span(&self.service, &self.operation, &envelope);
        let ctx = OperationContext::new(
            envelope,
            Arc::clone(&self.connection),
            span.clone(),
            Arc::clone(&self.service),
            Arc::clone(&self.operation),
        );

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.handler.handle(ctx).instrument(span.clone()))
            .catch_unwind()
            .await;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        span.record("duration_ms", duration_ms);
        span.record(
            "outcome",
            match &outcome {
                Ok(Ok(())) => "ok",
                Ok(Err(_)) => "error",
                Err(_) => "panic",
            },
        );

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(source)) => Some(HandlerError::Failed {
                service: self.service.to_string(),
                operation: self.operation.to_string(),
                subject: subject.clone(),
                source,
            }),
            Err(panic) => Some(HandlerError::Panicked {
                service: self.service.to_string(),
                operation: self.operation.to_string(),
                subject: subject.clone(),
                message: panic_message(panic.as_ref()),
            }),
        };

        match failure {
            None => self.stats.record_handled(),
            Some(err) => {
                self.stats.record_failed();
                let chain = format!("{:#}", anyhow::Error::from(err));
                error!(
                    operation = %self.operation,
                    service = %self.service,
                    subject = %subject,
                    error = %chain,
                    "failed to handle request"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Mutable lifecycle parts, changed only under the dispatcher's lock.
struct Lifecycle {
    queue: Option<mpsc::UnboundedSender<Envelope>>,
    worker: Option<JoinHandle<()>>,
}

/// Admission-and-execution engine for one operation.
///
/// State machine: Created -> Running -> Draining -> Stopped
///
/// - `start()` spawns the worker; envelopes are admitted from then on.
/// - `stop()` closes admission, then waits until every queued envelope and
///   every in-flight invocation has finished.
pub struct Dispatcher {
    invoker: Arc<Invoker>,
    concurrency: Concurrency,
    state: StateCell,
    lifecycle: Mutex<Lifecycle>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        service: &str,
        operation: &OperationDescriptor,
        connection: Arc<dyn BusConnection>,
    ) -> Self {
        Self {
            invoker: Arc::new(Invoker {
                service: Arc::from(service),
                operation: Arc::from(operation.name()),
                handler: operation.handler(),
                connection,
                stats: Arc::new(DispatchStats::default()),
            }),
            concurrency: operation.concurrency(),
            state: StateCell::new(),
            lifecycle: Mutex::new(Lifecycle {
                queue: None,
                worker: None,
            }),
        }
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.invoker.operation
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    #[must_use]
    pub fn stats(&self) -> DispatchSnapshot {
        self.invoker.stats.snapshot()
    }

    /// Begin admitting envelopes.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidState` unless the dispatcher is `Created`.
    pub fn start(&self) -> Result<(), RuntimeError> {
        let mut lifecycle = self.lifecycle.lock();
        let state = self.state.get();
        if state != LifecycleState::Created {
            return Err(RuntimeError::InvalidState {
                action: "start dispatcher",
                state,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = self
            .concurrency
            .limit()
            .map(|limit| Arc::new(Semaphore::new(limit.min(Semaphore::MAX_PERMITS))));
        lifecycle.queue = Some(tx);
        lifecycle.worker = Some(tokio::spawn(run_worker(
            Arc::clone(&self.invoker),
            rx,
            semaphore,
        )));
        self.state.set(LifecycleState::Running);
        Ok(())
    }

    /// Admit one envelope into the queue. Never blocks.
    ///
    /// # Errors
    ///
    /// Hands the envelope back when the dispatcher is not `Running`.
    pub fn admit(&self, envelope: Envelope) -> Result<(), Rejected> {
        let lifecycle = self.lifecycle.lock();
        let Some(queue) = lifecycle.queue.as_ref() else {
            return Err(Rejected {
                envelope,
                state: self.state.get(),
            });
        };
        // Count before sending so the worker can never finish an envelope
        // that is not yet counted as admitted.
        self.invoker.stats.record_admitted();
        match queue.send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(envelope)) => {
                self.invoker.stats.revoke_admitted();
                Err(Rejected {
                    envelope,
                    state: self.state.get(),
                })
            }
        }
    }

    /// Stop admitting and drain. Returns once every admitted envelope has
    /// reached a terminal outcome.
    ///
    /// Stopping a `Created` dispatcher moves it straight to `Stopped`;
    /// stopping a `Stopped` one is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::InvalidState` when another stop is already
    /// draining this dispatcher.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let worker = {
            let mut lifecycle = self.lifecycle.lock();
            match self.state.get() {
                LifecycleState::Created => {
                    self.state.set(LifecycleState::Stopped);
                    return Ok(());
                }
                LifecycleState::Stopped => return Ok(()),
                state @ LifecycleState::Draining => {
                    return Err(RuntimeError::InvalidState {
                        action: "stop dispatcher",
                        state,
                    });
                }
                LifecycleState::Running => {}
            }
            self.state.set(LifecycleState::Draining);
            // Dropping the only sender closes the queue; the worker exits
            // after it has consumed everything already queued.
            lifecycle.queue.take();
            lifecycle.worker.take()
        };

        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(
                    operation = %self.invoker.operation,
                    service = %self.invoker.service,
                    error = %err,
                    "dispatcher worker terminated abnormally"
                );
            }
        }

        self.state.set(LifecycleState::Stopped);
        let stats = self.stats();
        info!(
            operation = %self.invoker.operation,
            service = %self.invoker.service,
            handled = stats.handled,
            failed = stats.failed,
            "dispatcher drained"
        );
        Ok(())
    }
}

/// Worker loop: FIFO admission into execution, bounded by `semaphore`.
async fn run_worker(
    invoker: Arc<Invoker>,
    mut queue: mpsc::UnboundedReceiver<Envelope>,
    semaphore: Option<Arc<Semaphore>>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join_error(&invoker, joined);
            }
            next = queue.recv() => {
                let Some(envelope) = next else {
                    break;
                };
                // The semaphore is never closed, so acquisition only waits.
                let permit = match &semaphore {
                    Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
                    None => None,
                };
                in_flight.spawn(Arc::clone(&invoker).invoke(envelope, permit));
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        log_join_error(&invoker, joined);
    }
}

fn log_join_error(invoker: &Invoker, joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(
            operation = %invoker.operation,
            service = %invoker.service,
            error = %err,
            "invocation task aborted"
        );
    }
}
