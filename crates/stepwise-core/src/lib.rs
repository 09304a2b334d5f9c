//!
//! Stepwise Core - resumable flow engine
//!
//! This crate drives flow instances through a linear sequence of steps,
//! checkpointing after every transition so that an instance can be paused
//! for an external signal, retried under a policy, cancelled, or recovered
//! after a crash without losing or repeating completed work.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flow models, state machine and repository interfaces
pub mod domain;

/// Application services - execution, resume arbitration and orchestration
pub mod application;

/// Core types
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

// Re-export key types
pub use config::{EngineConfig, PersistenceRetryConfig, RetryPolicy};
pub use error::CoreError;
pub use types::FlowContext;

// Re-export main API types for easy use
pub use application::event_bus::{EventBus, EventHandler, InMemoryEventBus};
pub use application::handler::{
    handler_fn, ExecutionResult, HandlerRegistry, StaticHandlerRegistry, StepHandler,
    StepInvocation,
};
pub use application::orchestrator::{FlowOrchestrator, FlowOrchestratorBuilder, RecoveryReport};
pub use application::timeout_scheduler::{Clock, SystemClock};
pub use domain::condition::{ConditionEvaluator, ConditionExpression, JmesPathConditionEvaluator};
pub use domain::events::{BusMessage, EntityEvent, EventTarget, ExternalEvent, FlowEvent};
pub use domain::flow_definition::{
    FlowDefinition, StepDefinition, WaitSpec, WaitTimeoutAction,
};
pub use domain::flow_instance::{
    CorrelationId, FlowId, FlowInstance, FlowInstanceId, FlowStatus, StepId, StepInstance,
    StepStatus,
};
pub use domain::repository::{FlowDefinitionRepository, PersistenceGateway};
pub use domain::resume::{ResumeOutcome, ResumeReason, ResumeRequest};
pub use domain::state_machine::FlowStateMachine;

#[cfg(feature = "testing")]
pub use application::timeout_scheduler::ManualClock;
