//! Service and operation descriptors and the registration builder.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::OperationContext;
use crate::error::ConfigurationError;

/// Prefix of the bus group every service's operations are bound under.
pub const GROUP_PREFIX: &str = "external";

// ---------------------------------------------------------------------------
// OperationHandler
// ---------------------------------------------------------------------------

/// Request-handling callback for one operation.
///
/// Returning `Err` (or panicking) is reported by the dispatcher and never
/// produces an automatic reply; handlers reply through the context.
#[async_trait]
pub trait OperationHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: OperationContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> OperationHandler for F
where
    F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: OperationContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Adapts a synchronous closure into an `OperationHandler`.
pub struct SyncHandler<F>(F);

/// Wrap a synchronous handler body.
pub fn sync_handler<F>(f: F) -> SyncHandler<F>
where
    F: Fn(&OperationContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    SyncHandler(f)
}

#[async_trait]
impl<F> OperationHandler for SyncHandler<F>
where
    F: Fn(&OperationContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, ctx: OperationContext) -> anyhow::Result<()> {
        (self.0)(&ctx)
    }
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

/// Largest accepted concurrency bound. Matches the permit ceiling of the
/// semaphore the dispatcher gates on.
pub const MAX_CONCURRENCY: usize = usize::MAX >> 3;

/// Upper bound on concurrently executing handler invocations of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    #[default]
    Unbounded,
    Bounded(NonZeroUsize),
}

impl Concurrency {
    /// A bound of `limit` concurrent invocations.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::ZeroConcurrency` when `limit` is 0 and
    /// `ConfigurationError::ConcurrencyTooLarge` above [`MAX_CONCURRENCY`].
    pub fn bounded(limit: usize) -> Result<Self, ConfigurationError> {
        if limit > MAX_CONCURRENCY {
            return Err(ConfigurationError::ConcurrencyTooLarge {
                limit,
                max: MAX_CONCURRENCY,
            });
        }
        NonZeroUsize::new(limit)
            .map(Self::Bounded)
            .ok_or(ConfigurationError::ZeroConcurrency)
    }

    /// The numeric limit, or `None` when unbounded.
    #[must_use]
    pub fn limit(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Bounded(n) => Some(n.get()),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationDescriptor
// ---------------------------------------------------------------------------

/// One exposed capability of a service.
#[derive(Clone)]
pub struct OperationDescriptor {
    name: String,
    handler: Arc<dyn OperationHandler>,
    metadata: HashMap<String, String>,
    concurrency: Concurrency,
}

impl OperationDescriptor {
    /// # Errors
    ///
    /// Returns `ConfigurationError::EmptyOperationName` when `name` is empty.
    pub fn new(
        name: impl Into<String>,
        handler: impl OperationHandler,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigurationError::EmptyOperationName);
        }
        Ok(Self {
            name,
            handler: Arc::new(handler),
            metadata: HashMap::new(),
            concurrency: Concurrency::Unbounded,
        })
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn handler(&self) -> Arc<dyn OperationHandler> {
        Arc::clone(&self.handler)
    }

    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    #[must_use]
    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ServiceDescriptor
// ---------------------------------------------------------------------------

/// Immutable description of a service and its operations.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    name: String,
    version: String,
    description: String,
    metadata: HashMap<String, String>,
    operations: Vec<OperationDescriptor>,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Operations in registration order.
    #[must_use]
    pub fn operations(&self) -> &[OperationDescriptor] {
        &self.operations
    }

    /// Bus group the operations are bound under: `external.<name>`.
    #[must_use]
    pub fn group(&self) -> String {
        format!("{GROUP_PREFIX}.{}", self.name)
    }

    /// Full subject of `operation` within this service's group.
    #[must_use]
    pub fn subject_for(&self, operation: &str) -> String {
        format!("{}.{operation}", self.group())
    }
}

// ---------------------------------------------------------------------------
// ServiceBuilder
// ---------------------------------------------------------------------------

/// Accumulates registrations into a `ServiceDescriptor`.
///
/// Every method takes and returns the builder by value; `build` borrows, so
/// repeated calls yield independent descriptors with the same content.
#[derive(Debug, Clone)]
pub struct ServiceBuilder {
    name: String,
    version: String,
    description: String,
    metadata: HashMap<String, String>,
    operations: Vec<OperationDescriptor>,
}

impl ServiceBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            metadata: HashMap::new(),
            operations: Vec::new(),
        }
    }

    /// Start from a statically declared service definition.
    ///
    /// # Errors
    ///
    /// Returns `MissingServiceName`/`MissingServiceVersion` when the
    /// definition's identity is blank, or any error its `register` raises.
    pub fn from_definition<T: ServiceDefinition>(
        definition: T,
    ) -> Result<ServiceDescriptor, ConfigurationError> {
        if T::NAME.trim().is_empty() {
            return Err(ConfigurationError::MissingServiceName);
        }
        if T::VERSION.trim().is_empty() {
            return Err(ConfigurationError::MissingServiceVersion {
                service: T::NAME.to_string(),
            });
        }
        let definition = Arc::new(definition);
        let builder = Self::new(T::NAME, T::VERSION)
            .with_description(T::DESCRIPTION)
            .with_metadata(definition.metadata());
        definition.register(builder)?.build()
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Register an unbounded operation without metadata.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::EmptyOperationName` when `name` is empty.
    pub fn with_operation(
        self,
        name: impl Into<String>,
        handler: impl OperationHandler,
    ) -> Result<Self, ConfigurationError> {
        Ok(self.with_descriptor(OperationDescriptor::new(name, handler)?))
    }

    /// Register an operation with explicit metadata and concurrency bound.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::EmptyOperationName` when `name` is empty.
    pub fn with_operation_options(
        self,
        name: impl Into<String>,
        handler: impl OperationHandler,
        metadata: HashMap<String, String>,
        concurrency: Concurrency,
    ) -> Result<Self, ConfigurationError> {
        let op = OperationDescriptor::new(name, handler)?
            .with_metadata(metadata)
            .with_concurrency(concurrency);
        Ok(self.with_descriptor(op))
    }

    /// Register a prebuilt descriptor.
    #[must_use]
    pub fn with_descriptor(mut self, operation: OperationDescriptor) -> Self {
        self.operations.push(operation);
        self
    }

    /// Produce the service descriptor.
    ///
    /// # Errors
    ///
    /// Returns `MissingServiceName` or `MissingServiceVersion` when either
    /// identity field is blank.
    pub fn build(&self) -> Result<ServiceDescriptor, ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::MissingServiceName);
        }
        if self.version.trim().is_empty() {
            return Err(ConfigurationError::MissingServiceVersion {
                service: self.name.clone(),
            });
        }
        Ok(ServiceDescriptor {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            metadata: self.metadata.clone(),
            operations: self.operations.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// ServiceDefinition
// ---------------------------------------------------------------------------

/// Statically declared service: identity as associated constants and an
/// explicit registration table.
///
/// ```ignore
/// struct Greeter;
///
/// impl ServiceDefinition for Greeter {
///     const NAME: &'static str = "greeter";
///     const VERSION: &'static str = "1.0.0";
///
///     fn register(
///         self: Arc<Self>,
///         builder: ServiceBuilder,
///     ) -> Result<ServiceBuilder, ConfigurationError> {
///         let this = Arc::clone(&self);
///         builder.with_operation("greet", move |ctx: OperationContext| {
///             let this = Arc::clone(&this);
///             async move { this.greet(ctx).await }
///         })
///     }
/// }
/// ```
pub trait ServiceDefinition: Send + Sync + Sized + 'static {
    const NAME: &'static str;
    const VERSION: &'static str;
    const DESCRIPTION: &'static str = "";

    fn metadata(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Add this service's operations to `builder`.
    ///
    /// # Errors
    ///
    /// Propagates registration errors.
    fn register(self: Arc<Self>, builder: ServiceBuilder)
        -> Result<ServiceBuilder, ConfigurationError>;
}
