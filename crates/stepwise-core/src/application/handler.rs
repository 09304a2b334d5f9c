use crate::domain::flow_definition::WaitSpec;
use crate::domain::flow_instance::{FlowInstanceId, StepId};
use crate::domain::resume::ResumeRequest;
use crate::types::FlowContext;
use crate::CoreError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of one handler invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// The handler produced output to merge into the flow context
    Success(FlowContext),
    /// The handler failed with a reason
    Failure(String),
    /// The handler needs to wait for a resume before it can finish
    Pending(WaitSpec),
}

/// Everything a handler gets to see about the attempt it runs
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// The flow instance
    pub flow_instance_id: FlowInstanceId,
    /// The step
    pub step_id: StepId,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Snapshot of the flow context
    pub context: FlowContext,
    /// The resume that re-admitted the step, if any
    pub resume: Option<ResumeRequest>,
}

/// A step handler capability
///
/// Handlers must observe `cancel` promptly. The engine gives up on a
/// handler that ignores it past the grace period, but cannot undo any side
/// effects it already produced, so handlers should be idempotent.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run one attempt
    async fn handle(&self, invocation: StepInvocation, cancel: CancellationToken)
        -> ExecutionResult;
}

type HandlerFn =
    dyn Fn(StepInvocation, CancellationToken) -> BoxFuture<'static, ExecutionResult> + Send + Sync;

/// Step handler backed by a closure
pub struct FnHandler {
    f: Box<HandlerFn>,
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl StepHandler for FnHandler {
    async fn handle(
        &self,
        invocation: StepInvocation,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        (self.f)(invocation, cancel).await
    }
}

/// Wrap an async closure as a step handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepInvocation, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionResult> + Send + 'static,
{
    Arc::new(FnHandler {
        f: Box::new(move |invocation, cancel| Box::pin(f(invocation, cancel))),
    })
}

/// Resolves handler names to capabilities
pub trait HandlerRegistry: Send + Sync {
    /// Resolve a handler by name
    fn resolve(&self, name: &str) -> Result<Arc<dyn StepHandler>, CoreError>;
}

/// Registry over a fixed set of handlers
#[derive(Default, Clone)]
pub struct StaticHandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StaticHandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`
    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }
}

impl HandlerRegistry for StaticHandlerRegistry {
    fn resolve(&self, name: &str) -> Result<Arc<dyn StepHandler>, CoreError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::HandlerNotFound(name.to_string()))
    }
}
