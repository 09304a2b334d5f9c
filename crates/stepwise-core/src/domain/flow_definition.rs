use crate::config::{RetryPolicy, MAX_DURATION_MS};
use crate::domain::condition::ConditionExpression;
use crate::domain::flow_instance::{FlowId, StepId};
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A published, immutable flow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// ID of the flow
    pub id: FlowId,

    /// Version of the flow, starting at 1
    pub version: u32,

    /// Human-readable name of the flow
    pub name: String,

    /// Steps in declaration order
    pub steps: Vec<StepDefinition>,

    /// Context keys that must be present when a flow is started
    #[serde(default)]
    pub required_context: Vec<String>,
}

/// A single step of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// ID of the step, unique within its flow
    pub id: StepId,

    /// Name of the handler capability to invoke
    pub handler: String,

    /// Maximum number of attempts, at least 1
    pub max_attempts: u32,

    /// Per-attempt timeout
    pub timeout_ms: u64,

    /// When true the step is skipped without running its handler
    #[serde(default)]
    pub skip_condition: Option<ConditionExpression>,

    /// Gate evaluated for `Condition` resume requests
    #[serde(default)]
    pub resume_condition: Option<ConditionExpression>,

    /// Wait the step performs before its handler runs
    #[serde(default)]
    pub wait: Option<WaitSpec>,

    /// Step-level override of the engine retry policy
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Successor rules
    #[serde(default)]
    pub branch: BranchRules,
}

/// Which step follows a given outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRules {
    /// Successor after `Completed` or `Skipped`
    #[serde(default)]
    pub on_success: Successor,

    /// Successor after a terminal `Failed`
    #[serde(default)]
    pub on_failure: Option<StepId>,
}

/// Successor of a step that completed or was skipped
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Successor {
    /// The following step in declaration order
    #[default]
    Next,

    /// A specific step
    Step(StepId),

    /// The flow ends here
    End,
}

/// What a paused step is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitSpec {
    /// Event type that can resume the step; `None` accepts no events
    #[serde(default)]
    pub event_type: Option<String>,

    /// Wait deadline relative to the moment the step paused
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Behaviour once the deadline elapses
    #[serde(default)]
    pub on_timeout: WaitTimeoutAction,
}

impl WaitSpec {
    /// Wait for an external event
    pub fn event(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            timeout_ms: None,
            on_timeout: WaitTimeoutAction::default(),
        }
    }

    /// Wait for a manual, system or condition resume
    pub fn manual() -> Self {
        Self {
            event_type: None,
            timeout_ms: None,
            on_timeout: WaitTimeoutAction::default(),
        }
    }

    /// Set a deadline and the action taken when it elapses
    pub fn with_timeout(mut self, timeout_ms: u64, on_timeout: WaitTimeoutAction) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self.on_timeout = on_timeout;
        self
    }

    fn validate(&self, step_id: &StepId) -> Result<(), CoreError> {
        if let Some(event_type) = &self.event_type {
            if event_type.trim().is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "Step {} waits on an empty event type",
                    step_id
                )));
            }
        }
        match self.timeout_ms {
            Some(0) => {
                return Err(CoreError::ValidationError(format!(
                    "Step {} has a zero wait timeout",
                    step_id
                )))
            }
            Some(ms) if ms > MAX_DURATION_MS => {
                return Err(CoreError::ValidationError(format!(
                    "Step {} wait timeout exceeds {} ms",
                    step_id, MAX_DURATION_MS
                )))
            }
            _ => {}
        }
        Ok(())
    }
}

/// Action taken when a wait deadline elapses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WaitTimeoutAction {
    /// Resume as if a manual resume had been admitted
    Resume,

    /// Fail the attempt with reason "timeout"; the retry rule applies
    #[default]
    Fail,

    /// Fail terminally and continue at a timeout-handler step
    Branch {
        /// The timeout-handler step
        step: StepId,
    },
}

impl FlowDefinition {
    /// Start building a definition
    pub fn builder(id: impl Into<String>) -> FlowDefinitionBuilder {
        FlowDefinitionBuilder::new(id)
    }

    /// Look up a step by ID
    pub fn step(&self, id: &StepId) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Look up a step, failing with a validation error when absent
    pub fn require_step(&self, id: &StepId) -> Result<&StepDefinition, CoreError> {
        self.step(id).ok_or_else(|| {
            CoreError::ValidationError(format!("Flow {} has no step {}", self.id, id))
        })
    }

    /// The first step in declaration order
    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }

    /// Successor after a step completed or was skipped
    pub fn success_successor(&self, id: &StepId) -> Result<Option<StepId>, CoreError> {
        let step = self.require_step(id)?;
        Ok(match &step.branch.on_success {
            Successor::Next => {
                let index = self.steps.iter().position(|s| &s.id == id);
                index.and_then(|i| self.steps.get(i + 1)).map(|s| s.id.clone())
            }
            Successor::Step(target) => Some(target.clone()),
            Successor::End => None,
        })
    }

    /// Validate the definition
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.version == 0 {
            return Err(CoreError::ValidationError(format!(
                "Flow {} must have a version of at least 1",
                self.id
            )));
        }

        if self.steps.is_empty() {
            return Err(CoreError::ValidationError(
                "Flow must have at least one step".to_string(),
            ));
        }

        let mut step_ids = HashSet::new();
        for step in &self.steps {
            if !step_ids.insert(&step.id) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate step ID: {}",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            step.validate()?;

            let mut targets = Vec::new();
            if let Successor::Step(target) = &step.branch.on_success {
                targets.push(target);
            }
            if let Some(target) = &step.branch.on_failure {
                if target == &step.id {
                    return Err(CoreError::ValidationError(format!(
                        "Step {} cannot be its own failure branch",
                        step.id
                    )));
                }
                targets.push(target);
            }
            if let Some(WaitSpec {
                on_timeout: WaitTimeoutAction::Branch { step: target },
                ..
            }) = &step.wait
            {
                targets.push(target);
            }

            for target in targets {
                if !step_ids.contains(target) {
                    return Err(CoreError::ValidationError(format!(
                        "Step {} references non-existent step: {}",
                        step.id, target
                    )));
                }
            }
        }

        Ok(())
    }
}

impl StepDefinition {
    /// Start building a step
    pub fn builder(id: impl Into<String>, handler: impl Into<String>) -> StepDefinitionBuilder {
        StepDefinitionBuilder::new(id, handler)
    }

    /// Validate the step in isolation
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.0.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "Step ID must not be empty".to_string(),
            ));
        }
        if self.handler.trim().is_empty() {
            return Err(CoreError::ValidationError(format!(
                "Step {} has no handler",
                self.id
            )));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::ValidationError(format!(
                "Step {} must allow at least one attempt",
                self.id
            )));
        }
        if self.timeout_ms == 0 || self.timeout_ms > MAX_DURATION_MS {
            return Err(CoreError::ValidationError(format!(
                "Step {} must have a timeout between 1 and {} ms",
                self.id, MAX_DURATION_MS
            )));
        }
        for condition in [&self.skip_condition, &self.resume_condition]
            .into_iter()
            .flatten()
        {
            condition.validate()?;
        }
        if let Some(wait) = &self.wait {
            wait.validate(&self.id)?;
        }
        if let Some(retry) = &self.retry {
            retry
                .validate()
                .map_err(|e| CoreError::ValidationError(format!("Step {}: {}", self.id, e)))?;
        }
        Ok(())
    }

    /// Retry policy in effect for this step
    pub fn retry_policy<'a>(&'a self, default: &'a RetryPolicy) -> &'a RetryPolicy {
        self.retry.as_ref().unwrap_or(default)
    }
}

/// Builder for [`FlowDefinition`]
#[derive(Debug)]
pub struct FlowDefinitionBuilder {
    id: String,
    version: u32,
    name: Option<String>,
    steps: Vec<StepDefinition>,
    required_context: Vec<String>,
}

impl FlowDefinitionBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            name: None,
            steps: Vec::new(),
            required_context: Vec::new(),
        }
    }

    /// Set the version
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the human-readable name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append a step
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Require a context key at flow start
    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required_context.push(key.into());
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<FlowDefinition, CoreError> {
        if self.id.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "Flow ID must not be empty".to_string(),
            ));
        }

        let definition = FlowDefinition {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: FlowId(self.id),
            version: self.version,
            steps: self.steps,
            required_context: self.required_context,
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// Builder for [`StepDefinition`]
#[derive(Debug)]
pub struct StepDefinitionBuilder {
    step: StepDefinition,
}

impl StepDefinitionBuilder {
    fn new(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            step: StepDefinition {
                id: StepId(id.into()),
                handler: handler.into(),
                max_attempts: 1,
                timeout_ms: 30_000,
                skip_condition: None,
                resume_condition: None,
                wait: None,
                retry: None,
                branch: BranchRules::default(),
            },
        }
    }

    /// Maximum number of attempts
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.step.max_attempts = max_attempts;
        self
    }

    /// Per-attempt timeout
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.step.timeout_ms = timeout_ms;
        self
    }

    /// Skip the step when the condition holds
    pub fn skip_when(mut self, condition: ConditionExpression) -> Self {
        self.step.skip_condition = Some(condition);
        self
    }

    /// Gate for `Condition` resume requests
    pub fn resume_when(mut self, condition: ConditionExpression) -> Self {
        self.step.resume_condition = Some(condition);
        self
    }

    /// Pause before the handler runs
    pub fn wait(mut self, wait: WaitSpec) -> Self {
        self.step.wait = Some(wait);
        self
    }

    /// Override the engine retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.step.retry = Some(retry);
        self
    }

    /// Continue at `step` after success
    pub fn then(mut self, step: impl Into<String>) -> Self {
        self.step.branch.on_success = Successor::Step(StepId(step.into()));
        self
    }

    /// End the flow after success
    pub fn end(mut self) -> Self {
        self.step.branch.on_success = Successor::End;
        self
    }

    /// Continue at `step` after a terminal failure
    pub fn on_failure(mut self, step: impl Into<String>) -> Self {
        self.step.branch.on_failure = Some(StepId(step.into()));
        self
    }

    /// Build and validate the step on its own
    pub fn build(self) -> Result<StepDefinition, CoreError> {
        self.step.validate()?;
        Ok(self.step)
    }
}
