//! Arbitration of resume requests against paused flow instances
//!
//! A request is only ever applied to an instance whose status is `Paused`,
//! under the instance's lock. Requests that do not match what the step is
//! waiting for leave the instance untouched.

use crate::application::checkpoint::CheckpointWriter;
use crate::application::dispatch::{InstanceLocks, WorkQueue};
use crate::application::step_executor::{StepExecutor, TIMEOUT_REASON};
use crate::application::timeout_scheduler::{Clock, TimeoutScheduler};
use crate::domain::condition::ConditionEvaluator;
use crate::domain::events::FlowEvent;
use crate::domain::flow_definition::{FlowDefinition, StepDefinition, WaitTimeoutAction};
use crate::domain::flow_instance::{FlowInstance, FlowStatus, StepId, StepStatus};
use crate::domain::repository::{FlowDefinitionRepository, PersistenceGateway};
use crate::domain::resume::{ResumeOutcome, ResumeReason, ResumeRequest};
use crate::domain::state_machine::FlowStateMachine;
use crate::CoreError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Context key for non-object payloads of requests without an event type
const RESUME_PAYLOAD_KEY: &str = "resume_payload";

/// Decides whether a resume request re-admits a paused instance
pub struct ResumeCoordinator {
    gateway: Arc<dyn PersistenceGateway>,
    definitions: Arc<dyn FlowDefinitionRepository>,
    evaluator: Arc<dyn ConditionEvaluator>,
    executor: Arc<StepExecutor>,
    checkpoints: Arc<CheckpointWriter>,
    scheduler: Arc<TimeoutScheduler>,
    queue: Arc<WorkQueue>,
    locks: Arc<InstanceLocks>,
    clock: Arc<dyn Clock>,
    lock_wait: Duration,
}

impl ResumeCoordinator {
    /// Create a coordinator
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        definitions: Arc<dyn FlowDefinitionRepository>,
        evaluator: Arc<dyn ConditionEvaluator>,
        executor: Arc<StepExecutor>,
        checkpoints: Arc<CheckpointWriter>,
        scheduler: Arc<TimeoutScheduler>,
        queue: Arc<WorkQueue>,
        locks: Arc<InstanceLocks>,
        clock: Arc<dyn Clock>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            gateway,
            definitions,
            evaluator,
            executor,
            checkpoints,
            scheduler,
            queue,
            locks,
            clock,
            lock_wait,
        }
    }

    /// Apply a resume request
    ///
    /// Fails with `TerminalStateViolation` for terminal instances and with
    /// `ConcurrencyConflict` when the instance is not paused or its lock
    /// cannot be acquired in time.
    pub async fn resume(&self, request: ResumeRequest) -> Result<ResumeOutcome, CoreError> {
        let id = request.flow_instance_id.clone();
        let _guard = self.locks.acquire(&id, self.lock_wait).await?;

        let instance = self
            .gateway
            .load_instance(&id)
            .await?
            .ok_or_else(|| CoreError::FlowInstanceNotFound(id.0.clone()))?;

        if instance.is_terminal() {
            return Err(CoreError::TerminalStateViolation(format!(
                "Flow instance {} is {}",
                id, instance.status
            )));
        }
        if instance.status != FlowStatus::Paused {
            return Err(CoreError::ConcurrencyConflict(format!(
                "Flow instance {} is {}, not paused",
                id, instance.status
            )));
        }

        let definition = self
            .definitions
            .find_version(&instance.flow_id, instance.flow_version)
            .await?
            .ok_or_else(|| {
                CoreError::FlowDefinitionNotFound(format!(
                    "{} v{}",
                    instance.flow_id, instance.flow_version
                ))
            })?;

        let (step_id, wait) = match instance.latest_step() {
            Some(step) if step.status == StepStatus::Paused => {
                (step.step_id.clone(), step.wait.clone())
            }
            _ => {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "Flow instance {} has no paused step",
                    id
                )))
            }
        };
        let step = definition.require_step(&step_id)?;
        let now = self.clock.now();

        match request.reason {
            ResumeReason::Manual | ResumeReason::System => {}
            ResumeReason::Event => {
                let expected = wait.as_ref().and_then(|w| w.event_type.as_deref());
                let received = request.event_type.as_deref();
                if expected.is_none() || expected != received {
                    debug!(
                        flow_instance_id = %id,
                        step_id = %step_id,
                        ?expected,
                        ?received,
                        "Event does not match the awaited event type"
                    );
                    return Ok(ResumeOutcome::Rejected {
                        reason: format!(
                            "step {} is not waiting for event {}",
                            step_id,
                            received.unwrap_or("<none>")
                        ),
                    });
                }
            }
            ResumeReason::Condition => {
                let Some(condition) = &step.resume_condition else {
                    return Ok(ResumeOutcome::Rejected {
                        reason: format!("step {} has no resume condition", step_id),
                    });
                };
                // The payload only becomes part of the context once admitted
                let mut candidate = instance.context.clone();
                if let Some(payload) = &request.payload {
                    candidate.merge_payload(payload, RESUME_PAYLOAD_KEY);
                }
                if !self.evaluator.evaluate(condition, &candidate)? {
                    debug!(flow_instance_id = %id, step_id = %step_id, "Resume condition is false");
                    return Ok(ResumeOutcome::Gated);
                }
            }
            ResumeReason::Timeout => {
                let Some(wait) = wait.filter(|w| w.deadline.map_or(false, |d| d <= now)) else {
                    return Ok(ResumeOutcome::Rejected {
                        reason: format!("wait deadline of step {} has not elapsed", step_id),
                    });
                };
                match wait.on_timeout {
                    WaitTimeoutAction::Resume => {}
                    WaitTimeoutAction::Fail => {
                        return self
                            .fail_on_timeout(instance, &definition, step, None, now)
                            .await;
                    }
                    WaitTimeoutAction::Branch { step: target } => {
                        return self
                            .fail_on_timeout(instance, &definition, step, Some(target), now)
                            .await;
                    }
                }
            }
        }

        self.admit(instance, &definition, step, request, now).await
    }

    async fn admit(
        &self,
        mut instance: FlowInstance,
        definition: &FlowDefinition,
        step: &StepDefinition,
        request: ResumeRequest,
        now: DateTime<Utc>,
    ) -> Result<ResumeOutcome, CoreError> {
        if let Some(payload) = &request.payload {
            let key = request.event_type.as_deref().unwrap_or(RESUME_PAYLOAD_KEY);
            instance.context.merge_payload(payload, key);
        }

        FlowStateMachine::transition_step(&mut instance, step, StepStatus::InProgress, None, now)?;
        if let Some(record) = instance.latest_step_mut() {
            record.gate_passed = true;
            record.resume = Some(request.clone());
        }
        instance.record_event(FlowEvent::ResumeAdmitted {
            flow_instance_id: instance.id.clone(),
            step_id: step.id.clone(),
            reason: request.reason,
            timestamp: now,
        });
        FlowStateMachine::sync_flow_status(&mut instance, definition, now)?;

        self.checkpoints.checkpoint(&mut instance).await?;
        self.scheduler.cancel(&instance.id);
        self.queue.enqueue(instance.id.clone());

        info!(
            flow_instance_id = %instance.id,
            step_id = %step.id,
            reason = %request.reason,
            requested_by = %request.requested_by,
            "Resume admitted"
        );
        Ok(ResumeOutcome::Admitted)
    }

    async fn fail_on_timeout(
        &self,
        mut instance: FlowInstance,
        definition: &FlowDefinition,
        step: &StepDefinition,
        branch: Option<StepId>,
        now: DateTime<Utc>,
    ) -> Result<ResumeOutcome, CoreError> {
        FlowStateMachine::transition_step(&mut instance, step, StepStatus::InProgress, None, now)?;
        FlowStateMachine::sync_flow_status(&mut instance, definition, now)?;
        self.checkpoints.checkpoint(&mut instance).await?;

        match branch {
            None => {
                self.executor.record_failure(
                    &mut instance,
                    definition,
                    step,
                    CoreError::TimeoutExceeded(step.id.to_string()),
                    now,
                )?;
            }
            Some(target) => {
                FlowStateMachine::transition_step(
                    &mut instance,
                    step,
                    StepStatus::Failed,
                    Some(TIMEOUT_REASON.to_string()),
                    now,
                )?;
                if let Some(record) = instance.latest_step_mut() {
                    record.branch_override = Some(target);
                }
                FlowStateMachine::sync_flow_status(&mut instance, definition, now)?;
            }
        }

        self.checkpoints.checkpoint(&mut instance).await?;
        self.scheduler.cancel(&instance.id);
        if !instance.is_terminal() {
            self.queue.enqueue(instance.id.clone());
        }

        info!(
            flow_instance_id = %instance.id,
            step_id = %step.id,
            status = %instance.status,
            "Wait deadline elapsed"
        );
        Ok(ResumeOutcome::Admitted)
    }
}
