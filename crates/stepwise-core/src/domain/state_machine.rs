//! Legal status transitions for steps and flows
//!
//! Every mutation of a step's status goes through [`FlowStateMachine`],
//! which records the transition in the step's history and raises the
//! matching [`FlowEvent`]. The flow status is never set directly: it is
//! derived from the latest step instance by [`FlowStateMachine::derive_flow_status`]
//! and applied with [`FlowStateMachine::sync_flow_status`].

use crate::domain::events::FlowEvent;
use crate::domain::flow_definition::{FlowDefinition, StepDefinition};
use crate::domain::flow_instance::{FlowInstance, FlowStatus, StepId, StepInstance, StepStatus};
use crate::CoreError;
use chrono::{DateTime, Utc};

/// Owner of the step and flow transition rules
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowStateMachine;

impl FlowStateMachine {
    /// Whether `from -> to` is a legal step edge
    pub fn is_legal_step_edge(from: StepStatus, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (from, to),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Paused)
                | (InProgress, Cancelled)
                | (Paused, InProgress)
                | (Paused, Cancelled)
                | (Failed, InProgress)
                | (Failed, Cancelled)
        )
    }

    /// Whether `from -> to` is a legal flow edge
    pub fn is_legal_flow_edge(from: FlowStatus, to: FlowStatus) -> bool {
        use FlowStatus::*;
        matches!(
            (from, to),
            (Pending, InProgress)
                | (Pending, Completed)
                | (Pending, Cancelled)
                | (InProgress, Paused)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (Paused, InProgress)
                | (Paused, Cancelled)
        )
    }

    /// Whether a failed step may re-enter `InProgress`
    pub fn can_retry(step: &StepInstance, definition: &StepDefinition) -> bool {
        step.status == StepStatus::Failed
            && step.branch_override.is_none()
            && step.attempt_count < definition.max_attempts
    }

    /// Whether the step instance can no longer change status
    pub fn is_step_terminal(step: &StepInstance, definition: &StepDefinition) -> bool {
        match step.status {
            StepStatus::Failed => !Self::can_retry(step, definition),
            status => status.is_final(),
        }
    }

    /// Append a new `Pending` step instance
    pub fn begin_step(
        instance: &mut FlowInstance,
        definition: &FlowDefinition,
        step_id: &StepId,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        Self::ensure_active(instance)?;
        definition.require_step(step_id)?;

        if let Some(latest) = instance.latest_step() {
            let latest_definition = definition.require_step(&latest.step_id)?;
            if !Self::is_step_terminal(latest, latest_definition) {
                return Err(CoreError::TerminalStateViolation(format!(
                    "Cannot start step {} while step {} is {}",
                    step_id, latest.step_id, latest.status
                )));
            }
        }

        instance.steps.push(StepInstance::new(step_id.clone()));
        instance.current_step = Some(step_id.clone());
        instance.updated_at = now;
        instance.record_event(FlowEvent::StepTransitioned {
            flow_instance_id: instance.id.clone(),
            step_id: step_id.clone(),
            from: None,
            to: StepStatus::Pending,
            attempt: 0,
            reason: None,
            timestamp: now,
        });

        Ok(())
    }

    /// Move the latest step instance to `to`
    pub fn transition_step(
        instance: &mut FlowInstance,
        definition: &StepDefinition,
        to: StepStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        Self::ensure_active(instance)?;

        let flow_instance_id = instance.id.clone();
        let step = instance.latest_step_mut().ok_or_else(|| {
            CoreError::TerminalStateViolation(format!(
                "Flow instance {} has no step to transition",
                flow_instance_id
            ))
        })?;

        if step.step_id != definition.id {
            return Err(CoreError::ValidationError(format!(
                "Step definition {} does not match current step {}",
                definition.id, step.step_id
            )));
        }

        let from = step.status;
        if !Self::is_legal_step_edge(from, to) {
            return Err(CoreError::TerminalStateViolation(format!(
                "Illegal transition {} -> {} for step {}",
                from, to, step.step_id
            )));
        }

        let enters_attempt =
            to == StepStatus::InProgress
                && matches!(from, StepStatus::Pending | StepStatus::Failed);
        if enters_attempt
            && (step.branch_override.is_some() || step.attempt_count >= definition.max_attempts)
        {
            return Err(CoreError::TerminalStateViolation(format!(
                "Step {} has exhausted its {} attempts",
                step.step_id, definition.max_attempts
            )));
        }

        match to {
            StepStatus::InProgress => {
                if enters_attempt {
                    step.attempt_count += 1;
                    step.started_at = Some(now);
                    step.completed_at = None;
                    step.failure_reason = None;
                    step.retry_at = None;
                    step.gate_passed = false;
                    step.resume = None;
                }
                step.wait = None;
            }
            StepStatus::Completed | StepStatus::Skipped => {
                step.completed_at = Some(now);
                step.wait = None;
            }
            StepStatus::Failed => {
                step.failure_reason = reason.clone();
                step.completed_at = Some(now);
            }
            StepStatus::Cancelled => {
                step.failure_reason = reason.clone();
                step.completed_at = Some(now);
                step.wait = None;
                step.retry_at = None;
            }
            StepStatus::Paused | StepStatus::Pending => {}
        }

        step.status = to;
        step.history.push(to);

        let step_id = step.step_id.clone();
        let attempt = step.attempt_count;

        instance.current_step = Some(step_id.clone());
        instance.updated_at = now;
        instance.record_event(FlowEvent::StepTransitioned {
            flow_instance_id,
            step_id,
            from: Some(from),
            to,
            attempt,
            reason,
            timestamp: now,
        });

        Ok(())
    }

    /// Flow status as a pure function of the latest step and flow overrides
    pub fn derive_flow_status(
        instance: &FlowInstance,
        definition: &FlowDefinition,
    ) -> Result<FlowStatus, CoreError> {
        if instance.cancelled_at.is_some() {
            return Ok(FlowStatus::Cancelled);
        }
        if instance.error.is_some() {
            return Ok(FlowStatus::Failed);
        }

        let Some(step) = instance.latest_step() else {
            return Ok(FlowStatus::Pending);
        };

        let status = match step.status {
            StepStatus::Pending if instance.steps.len() > 1 => FlowStatus::InProgress,
            StepStatus::Pending => FlowStatus::Pending,
            StepStatus::InProgress => FlowStatus::InProgress,
            StepStatus::Paused => FlowStatus::Paused,
            StepStatus::Cancelled => FlowStatus::Cancelled,
            StepStatus::Failed => {
                let step_definition = definition.require_step(&step.step_id)?;
                if Self::can_retry(step, step_definition)
                    || step.branch_override.is_some()
                    || step_definition.branch.on_failure.is_some()
                {
                    FlowStatus::InProgress
                } else {
                    FlowStatus::Failed
                }
            }
            StepStatus::Completed | StepStatus::Skipped => {
                if definition.success_successor(&step.step_id)?.is_some() {
                    FlowStatus::InProgress
                } else {
                    FlowStatus::Completed
                }
            }
        };

        Ok(status)
    }

    /// Apply the derived flow status, raising an event when it changes
    pub fn sync_flow_status(
        instance: &mut FlowInstance,
        definition: &FlowDefinition,
        now: DateTime<Utc>,
    ) -> Result<FlowStatus, CoreError> {
        let from = instance.status;
        let to = Self::derive_flow_status(instance, definition)?;
        if from == to {
            return Ok(to);
        }

        if !Self::is_legal_flow_edge(from, to) {
            return Err(CoreError::TerminalStateViolation(format!(
                "Illegal flow transition {} -> {} for instance {}",
                from, to, instance.id
            )));
        }

        instance.status = to;
        instance.updated_at = now;
        instance.record_event(FlowEvent::FlowStatusChanged {
            flow_instance_id: instance.id.clone(),
            from,
            to,
            timestamp: now,
        });

        Ok(to)
    }

    /// Step that follows the latest step instance, once it is terminal
    ///
    /// Completed and skipped steps follow their success rule; a terminal
    /// failure follows the timeout branch override or the failure branch.
    pub fn next_step(
        instance: &FlowInstance,
        definition: &FlowDefinition,
    ) -> Result<Option<StepId>, CoreError> {
        let Some(step) = instance.latest_step() else {
            return Ok(definition.first_step().map(|s| s.id.clone()));
        };
        let step_definition = definition.require_step(&step.step_id)?;

        match step.status {
            StepStatus::Completed | StepStatus::Skipped => {
                definition.success_successor(&step.step_id)
            }
            StepStatus::Failed if !Self::can_retry(step, step_definition) => Ok(step
                .branch_override
                .clone()
                .or_else(|| step_definition.branch.on_failure.clone())),
            _ => Ok(None),
        }
    }

    /// Force the flow into `Cancelled`, aborting the current step
    pub fn cancel(
        instance: &mut FlowInstance,
        definition: &FlowDefinition,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        Self::ensure_active(instance)?;

        if let Some(step) = instance.latest_step() {
            let step_definition = definition.require_step(&step.step_id)?;
            if !Self::is_step_terminal(step, step_definition) {
                Self::transition_step(
                    instance,
                    step_definition,
                    StepStatus::Cancelled,
                    Some(reason.to_string()),
                    now,
                )?;
            }
        }

        instance.cancelled_at = Some(now);
        Self::sync_flow_status(instance, definition, now)?;
        Ok(())
    }

    fn ensure_active(instance: &FlowInstance) -> Result<(), CoreError> {
        if instance.is_terminal() {
            return Err(CoreError::TerminalStateViolation(format!(
                "Flow instance {} is {}",
                instance.id, instance.status
            )));
        }
        Ok(())
    }
}
