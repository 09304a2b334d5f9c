//! Runs one step attempt and turns its result into a status transition

use crate::application::handler::{ExecutionResult, HandlerRegistry, StepInvocation};
use crate::config::RetryPolicy;
use crate::domain::flow_definition::{FlowDefinition, StepDefinition, WaitSpec};
use crate::domain::flow_instance::{FlowInstance, FlowStatus, StepStatus, WaitState};
use crate::domain::state_machine::FlowStateMachine;
use crate::types::FlowContext;
use crate::CoreError;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Failure reason recorded when an attempt exceeds its timeout
pub const TIMEOUT_REASON: &str = "timeout";

/// What happened to one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The handler returned output
    Completed(FlowContext),
    /// The handler asked to wait for a resume
    Await(WaitSpec),
    /// The handler failed, panicked or could not be resolved
    Failed(CoreError),
    /// The per-attempt timeout fired first
    TimedOut,
    /// The flow was cancelled while the handler ran
    Cancelled,
}

/// When a failed step runs again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    /// No attempts left
    Exhausted,
    /// Retry right away
    Immediate,
    /// Retry once the deadline passes
    At(DateTime<Utc>),
}

enum Interrupt {
    Timeout,
    Cancel,
}

/// Invokes step handlers under a timeout and records their outcome
pub struct StepExecutor {
    handlers: Arc<dyn HandlerRegistry>,
    grace_period: Duration,
    default_retry: RetryPolicy,
}

impl StepExecutor {
    /// Create an executor
    pub fn new(
        handlers: Arc<dyn HandlerRegistry>,
        grace_period: Duration,
        default_retry: RetryPolicy,
    ) -> Self {
        Self {
            handlers,
            grace_period,
            default_retry,
        }
    }

    /// Run one attempt of `step`
    ///
    /// The handler runs on its own task. When the timeout or `cancel` fires
    /// first, the handler's token is cancelled and it gets the grace period
    /// to wind down before its task is aborted.
    pub async fn execute(
        &self,
        step: &StepDefinition,
        invocation: StepInvocation,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let handler = match self.handlers.resolve(&step.handler) {
            Ok(handler) => handler,
            Err(_) => {
                return StepOutcome::Failed(CoreError::HandlerExecutionError(format!(
                    "handler not found: {}",
                    step.handler
                )))
            }
        };

        let flow_instance_id = invocation.flow_instance_id.clone();
        let attempt = invocation.attempt;
        debug!(
            flow_instance_id = %flow_instance_id,
            step_id = %step.id,
            attempt,
            handler = %step.handler,
            "Invoking step handler"
        );

        let handler_token = cancel.child_token();
        let token = handler_token.clone();
        let mut task = tokio::spawn(async move { handler.handle(invocation, token).await });

        let interrupt = tokio::select! {
            joined = &mut task => return Self::joined(joined),
            _ = tokio::time::sleep(Duration::from_millis(step.timeout_ms)) => Interrupt::Timeout,
            _ = cancel.cancelled() => Interrupt::Cancel,
        };

        handler_token.cancel();
        if tokio::time::timeout(self.grace_period, &mut task).await.is_err() {
            task.abort();
            warn!(
                flow_instance_id = %flow_instance_id,
                step_id = %step.id,
                attempt,
                "Handler ignored cancellation past the grace period"
            );
        }

        match interrupt {
            Interrupt::Timeout => {
                warn!(
                    flow_instance_id = %flow_instance_id,
                    step_id = %step.id,
                    attempt,
                    timeout_ms = step.timeout_ms,
                    "Step attempt timed out"
                );
                StepOutcome::TimedOut
            }
            Interrupt::Cancel => StepOutcome::Cancelled,
        }
    }

    fn joined(joined: Result<ExecutionResult, JoinError>) -> StepOutcome {
        match joined {
            Ok(ExecutionResult::Success(output)) => StepOutcome::Completed(output),
            Ok(ExecutionResult::Failure(reason)) => {
                StepOutcome::Failed(CoreError::HandlerExecutionError(reason))
            }
            Ok(ExecutionResult::Pending(wait)) => StepOutcome::Await(wait),
            Err(e) if e.is_panic() => StepOutcome::Failed(CoreError::HandlerExecutionError(
                format!("handler panicked: {}", panic_message(e.into_panic())),
            )),
            Err(e) => {
                StepOutcome::Failed(CoreError::HandlerExecutionError(format!(
                    "handler aborted: {}",
                    e
                )))
            }
        }
    }

    /// Decide when a step that just failed its `attempt`-th attempt runs again
    pub fn plan_retry(&self, step: &StepDefinition, attempt: u32, now: DateTime<Utc>) -> RetryPlan {
        if attempt >= step.max_attempts {
            return RetryPlan::Exhausted;
        }

        let delay = step.retry_policy(&self.default_retry).delay_for(attempt);
        if delay.is_zero() {
            return RetryPlan::Immediate;
        }

        // An unrepresentable retry deadline ends the retries
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .map_or(RetryPlan::Exhausted, RetryPlan::At)
    }

    /// Apply an attempt's outcome to the latest step and sync the flow status
    pub fn record_outcome(
        &self,
        instance: &mut FlowInstance,
        definition: &FlowDefinition,
        step: &StepDefinition,
        outcome: StepOutcome,
        now: DateTime<Utc>,
    ) -> Result<FlowStatus, CoreError> {
        match outcome {
            StepOutcome::Completed(output) => {
                let status = StepStatus::Completed;
                FlowStateMachine::transition_step(instance, step, status, None, now)?;
                instance.context.merge(&output);
                if let Some(record) = instance.latest_step_mut() {
                    record.output = output;
                }
            }
            StepOutcome::Await(wait) => {
                let wait = match WaitState::from_spec(&wait, now) {
                    Ok(wait) => wait,
                    Err(e) => return self.record_failure(instance, definition, step, e, now),
                };
                FlowStateMachine::transition_step(instance, step, StepStatus::Paused, None, now)?;
                if let Some(record) = instance.latest_step_mut() {
                    record.wait = Some(wait);
                }
            }
            StepOutcome::Failed(error) => {
                return self.record_failure(instance, definition, step, error, now);
            }
            StepOutcome::TimedOut => {
                let error = CoreError::TimeoutExceeded(step.id.to_string());
                return self.record_failure(instance, definition, step, error, now);
            }
            StepOutcome::Cancelled => {
                FlowStateMachine::cancel(instance, definition, "cancelled", now)?;
                return Ok(instance.status);
            }
        }

        FlowStateMachine::sync_flow_status(instance, definition, now)
    }

    /// Fail the current attempt with `error` and plan its retry
    pub fn record_failure(
        &self,
        instance: &mut FlowInstance,
        definition: &FlowDefinition,
        step: &StepDefinition,
        error: CoreError,
        now: DateTime<Utc>,
    ) -> Result<FlowStatus, CoreError> {
        let reason = error.failure_reason();
        FlowStateMachine::transition_step(
            instance,
            step,
            StepStatus::Failed,
            Some(reason.clone()),
            now,
        )?;

        let flow_instance_id = instance.id.clone();
        if let Some(record) = instance.latest_step_mut() {
            let plan = self.plan_retry(step, record.attempt_count, now);
            warn!(
                flow_instance_id = %flow_instance_id,
                step_id = %step.id,
                attempt = record.attempt_count,
                max_attempts = step.max_attempts,
                reason = %reason,
                ?plan,
                "Step attempt failed"
            );
            if let RetryPlan::At(deadline) = plan {
                record.retry_at = Some(deadline);
            }
        }

        FlowStateMachine::sync_flow_status(instance, definition, now)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::handler::{handler_fn, StaticHandlerRegistry};
    use crate::domain::flow_instance::{CorrelationId, FlowId, FlowInstanceId, StepId};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn executor(registry: StaticHandlerRegistry) -> StepExecutor {
        StepExecutor::new(
            Arc::new(registry),
            Duration::from_secs(1),
            RetryPolicy::Immediate,
        )
    }

    fn invocation(step: &str) -> StepInvocation {
        StepInvocation {
            flow_instance_id: FlowInstanceId::from("i1"),
            step_id: StepId::from(step),
            attempt: 1,
            context: FlowContext::new(),
            resume: None,
        }
    }

    fn step(handler: &str, timeout_ms: u64) -> StepDefinition {
        StepDefinition::builder("charge", handler)
            .max_attempts(3)
            .timeout_ms(timeout_ms)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_and_failure() {
        let registry = StaticHandlerRegistry::new()
            .register(
                "ok",
                handler_fn(|_, _| async {
                    ExecutionResult::Success(FlowContext::new().with("charge_id", json!("ch_1")))
                }),
            )
            .register(
                "declined",
                handler_fn(|_, _| async { ExecutionResult::Failure("card declined".to_string()) }),
            );
        let executor = executor(registry);
        let token = CancellationToken::new();

        let outcome = executor
            .execute(&step("ok", 1_000), invocation("charge"), &token)
            .await;
        assert!(matches!(
            outcome,
            StepOutcome::Completed(ctx) if ctx.get("charge_id") == Some(&json!("ch_1"))
        ));

        let outcome = executor
            .execute(&step("declined", 1_000), invocation("charge"), &token)
            .await;
        assert_eq!(
            outcome,
            StepOutcome::Failed(CoreError::HandlerExecutionError("card declined".to_string()))
        );
    }

    #[tokio::test]
    async fn test_missing_handler_and_panic() {
        let registry = StaticHandlerRegistry::new().register(
            "boom",
            handler_fn(|invocation: StepInvocation, _| async move {
                if invocation.attempt > 0 {
                    panic!("provider exploded");
                }
                ExecutionResult::Success(FlowContext::new())
            }),
        );
        let executor = executor(registry);
        let token = CancellationToken::new();

        let outcome = executor
            .execute(&step("absent", 1_000), invocation("charge"), &token)
            .await;
        assert_eq!(
            outcome,
            StepOutcome::Failed(CoreError::HandlerExecutionError(
                "handler not found: absent".to_string()
            ))
        );

        let outcome = executor
            .execute(&step("boom", 1_000), invocation("charge"), &token)
            .await;
        assert_eq!(
            outcome,
            StepOutcome::Failed(CoreError::HandlerExecutionError(
                "handler panicked: provider exploded".to_string()
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_cooperative_handler() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        let registry = StaticHandlerRegistry::new().register(
            "slow",
            handler_fn(move |_, cancel: CancellationToken| {
                let flag = flag.clone();
                async move {
                    cancel.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    ExecutionResult::Failure("cancelled".to_string())
                }
            }),
        );
        let executor = executor(registry);

        let outcome = executor
            .execute(&step("slow", 5_000), invocation("charge"), &CancellationToken::new())
            .await;
        assert_eq!(outcome, StepOutcome::TimedOut);
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_stubborn_handler() {
        let registry = StaticHandlerRegistry::new().register(
            "stuck",
            handler_fn(|_, _| std::future::pending::<ExecutionResult>()),
        );
        let executor = executor(registry);

        let started = tokio::time::Instant::now();
        let outcome = executor
            .execute(&step("stuck", 5_000), invocation("charge"), &CancellationToken::new())
            .await;
        assert_eq!(outcome, StepOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel() {
        let registry = StaticHandlerRegistry::new().register(
            "stuck",
            handler_fn(|_, _| std::future::pending::<ExecutionResult>()),
        );
        let executor = executor(registry);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let outcome = executor
            .execute(&step("stuck", 60_000), invocation("charge"), &token)
            .await;
        assert_eq!(outcome, StepOutcome::Cancelled);
    }

    #[test]
    fn test_plan_retry() {
        let registry = StaticHandlerRegistry::new();
        let executor = StepExecutor::new(
            Arc::new(registry),
            Duration::from_secs(1),
            RetryPolicy::Fixed { delay_ms: 500 },
        );
        let now = Utc::now();
        let charge = step("ok", 1_000);

        assert_eq!(
            executor.plan_retry(&charge, 1, now),
            RetryPlan::At(now + chrono::Duration::milliseconds(500))
        );
        assert_eq!(executor.plan_retry(&charge, 3, now), RetryPlan::Exhausted);

        let immediate = StepDefinition::builder("charge", "ok")
            .max_attempts(2)
            .retry(RetryPolicy::Immediate)
            .build()
            .unwrap();
        assert_eq!(executor.plan_retry(&immediate, 1, now), RetryPlan::Immediate);
    }

    #[test]
    fn test_record_failure_sets_retry_deadline() {
        let executor = StepExecutor::new(
            Arc::new(StaticHandlerRegistry::new()),
            Duration::from_secs(1),
            RetryPolicy::Fixed { delay_ms: 1_000 },
        );
        let definition = FlowDefinition::builder("payment")
            .step(step("charge", 1_000))
            .build()
            .unwrap();
        let charge = definition.steps[0].clone();
        let now = Utc::now();
        let mut instance = FlowInstance::new(
            FlowId::from("payment"),
            1,
            FlowContext::new(),
            CorrelationId::from("c1"),
            now,
        );

        FlowStateMachine::begin_step(&mut instance, &definition, &charge.id, now).unwrap();
        FlowStateMachine::transition_step(&mut instance, &charge, StepStatus::InProgress, None, now)
            .unwrap();
        let status = executor
            .record_outcome(&mut instance, &definition, &charge, StepOutcome::TimedOut, now)
            .unwrap();

        assert_eq!(status, FlowStatus::InProgress);
        let record = instance.latest_step().unwrap();
        assert_eq!(record.failure_reason.as_deref(), Some(TIMEOUT_REASON));
        assert_eq!(record.retry_at, Some(now + chrono::Duration::seconds(1)));
    }
}
