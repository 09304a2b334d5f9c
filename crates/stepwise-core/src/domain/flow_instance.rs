use crate::domain::events::FlowEvent;
use crate::domain::flow_definition::{WaitSpec, WaitTimeoutAction};
use crate::domain::resume::ResumeRequest;
use crate::types::FlowContext;
use crate::CoreError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Value object: Flow ID
    FlowId
);
string_id!(
    /// Value object: Flow Instance ID
    FlowInstanceId
);
string_id!(
    /// Value object: Step ID
    StepId
);
string_id!(
    /// Value object: Correlation ID
    CorrelationId
);

impl FlowInstanceId {
    /// Generate a fresh random ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl CorrelationId {
    /// Generate a fresh random ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Status of a single step instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Created, not started
    Pending,
    /// Handler running or about to run
    InProgress,
    /// Handler returned output
    Completed,
    /// Attempt failed; terminal once attempts are exhausted
    Failed,
    /// Waiting for a resume
    Paused,
    /// Aborted by an external cancel
    Cancelled,
    /// Bypassed by its skip condition
    Skipped,
}

impl StepStatus {
    /// Whether no further edge can leave this status regardless of attempts
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Cancelled | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Paused => "paused",
            StepStatus::Cancelled => "cancelled",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Overall status of a flow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// No step has started
    Pending,
    /// A step is running or the flow is between steps
    InProgress,
    /// The current step waits for a resume
    Paused,
    /// The last step completed
    Completed,
    /// A step failed terminally without a failure branch
    Failed,
    /// Cancelled externally
    Cancelled,
}

impl FlowStatus {
    /// Completed, Failed and Cancelled are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowStatus::Pending => "pending",
            FlowStatus::InProgress => "in_progress",
            FlowStatus::Paused => "paused",
            FlowStatus::Completed => "completed",
            FlowStatus::Failed => "failed",
            FlowStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Kind of deadline tracked for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineKind {
    /// A paused step's wait deadline
    WaitDeadline,
    /// A delayed retry of a failed step
    RetryDue,
}

/// Wait state of a paused step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitState {
    /// Event type that can resume the step
    pub event_type: Option<String>,

    /// Absolute wait deadline
    pub deadline: Option<DateTime<Utc>>,

    /// Behaviour once the deadline elapses
    pub on_timeout: WaitTimeoutAction,

    /// When the wait began
    pub since: DateTime<Utc>,
}

impl WaitState {
    /// Anchor a wait spec at `now`
    ///
    /// Fails with `ValidationError` when the deadline is not representable.
    pub fn from_spec(spec: &WaitSpec, now: DateTime<Utc>) -> Result<Self, CoreError> {
        let deadline = match spec.timeout_ms {
            Some(ms) => Some(
                i64::try_from(ms)
                    .ok()
                    .and_then(Duration::try_milliseconds)
                    .and_then(|timeout| now.checked_add_signed(timeout))
                    .ok_or_else(|| {
                        CoreError::ValidationError(format!("Wait timeout out of range: {} ms", ms))
                    })?,
            ),
            None => None,
        };

        Ok(Self {
            event_type: spec.event_type.clone(),
            deadline,
            on_timeout: spec.on_timeout.clone(),
            since: now,
        })
    }
}

/// One execution record of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInstance {
    /// Step definition this record belongs to
    pub step_id: StepId,

    /// Current status
    pub status: StepStatus,

    /// Attempts started so far
    pub attempt_count: u32,

    /// Start of the latest attempt
    pub started_at: Option<DateTime<Utc>>,

    /// When the step reached its latest terminal or failed status
    pub completed_at: Option<DateTime<Utc>>,

    /// Reason of the latest failure or cancellation
    pub failure_reason: Option<String>,

    /// Output of the handler on success
    #[serde(default)]
    pub output: FlowContext,

    /// Every status held, in order
    pub history: Vec<StepStatus>,

    /// Set while the step is paused
    #[serde(default)]
    pub wait: Option<WaitState>,

    /// Whether the definition-level wait has been satisfied for this attempt
    #[serde(default)]
    pub gate_passed: bool,

    /// When a delayed retry becomes due
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,

    /// Successor forced by a timeout branch
    #[serde(default)]
    pub branch_override: Option<StepId>,

    /// The resume that re-admitted this step, if any
    #[serde(default)]
    pub resume: Option<ResumeRequest>,
}

impl StepInstance {
    /// Create a pending step instance
    pub fn new(step_id: StepId) -> Self {
        Self {
            step_id,
            status: StepStatus::Pending,
            attempt_count: 0,
            started_at: None,
            completed_at: None,
            failure_reason: None,
            output: FlowContext::new(),
            history: vec![StepStatus::Pending],
            wait: None,
            gate_passed: false,
            retry_at: None,
            branch_override: None,
            resume: None,
        }
    }
}

/// Aggregate: Flow instance
#[derive(Debug, Serialize, Deserialize)]
pub struct FlowInstance {
    /// Unique identifier
    pub id: FlowInstanceId,

    /// Flow definition ID
    pub flow_id: FlowId,

    /// Flow definition version this instance runs
    pub flow_version: u32,

    /// Step the instance is at
    pub current_step: Option<StepId>,

    /// Current status
    pub status: FlowStatus,

    /// Context shared across steps
    pub context: FlowContext,

    /// Correlation ID for external events
    pub correlation_id: CorrelationId,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Step history, oldest first
    pub steps: Vec<StepInstance>,

    /// Flow-level failure not attributable to a step
    pub error: Option<String>,

    /// Optimistic concurrency counter, bumped by each checkpoint
    pub revision: u64,

    /// Set when an external cancel was accepted
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Unpublished events
    #[serde(skip)]
    pub events: Vec<FlowEvent>,
}

// Snapshots never carry unpublished events
impl Clone for FlowInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            flow_id: self.flow_id.clone(),
            flow_version: self.flow_version,
            current_step: self.current_step.clone(),
            status: self.status,
            context: self.context.clone(),
            correlation_id: self.correlation_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            steps: self.steps.clone(),
            error: self.error.clone(),
            revision: self.revision,
            cancelled_at: self.cancelled_at,
            events: Vec::new(),
        }
    }
}

impl FlowInstance {
    /// Create a new flow instance in `Pending`
    pub fn new(
        flow_id: FlowId,
        flow_version: u32,
        context: FlowContext,
        correlation_id: CorrelationId,
        now: DateTime<Utc>,
    ) -> Self {
        let id = FlowInstanceId::generate();

        let mut instance = Self {
            id: id.clone(),
            flow_id: flow_id.clone(),
            flow_version,
            current_step: None,
            status: FlowStatus::Pending,
            context,
            correlation_id: correlation_id.clone(),
            created_at: now,
            updated_at: now,
            steps: Vec::with_capacity(8),
            error: None,
            revision: 0,
            cancelled_at: None,
            events: Vec::with_capacity(8),
        };

        instance.record_event(FlowEvent::FlowCreated {
            flow_instance_id: id,
            flow_id,
            correlation_id,
            timestamp: now,
        });

        instance
    }

    /// The most recent step instance
    #[inline]
    pub fn latest_step(&self) -> Option<&StepInstance> {
        self.steps.last()
    }

    /// Mutable access to the most recent step instance
    #[inline]
    pub fn latest_step_mut(&mut self) -> Option<&mut StepInstance> {
        self.steps.last_mut()
    }

    /// Whether the instance reached a terminal status
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The deadline the instance is waiting on, if any
    pub fn pending_deadline(&self) -> Option<(DeadlineKind, DateTime<Utc>)> {
        if self.is_terminal() {
            return None;
        }
        let step = self.latest_step()?;
        match step.status {
            StepStatus::Paused => step
                .wait
                .as_ref()
                .and_then(|w| w.deadline)
                .map(|d| (DeadlineKind::WaitDeadline, d)),
            StepStatus::Failed => step.retry_at.map(|d| (DeadlineKind::RetryDue, d)),
            _ => None,
        }
    }

    /// Record a domain event
    #[inline]
    pub fn record_event(&mut self, event: FlowEvent) {
        self.events.push(event);
    }

    /// Take all unpublished events
    #[inline]
    pub fn take_events(&mut self) -> Vec<FlowEvent> {
        std::mem::take(&mut self.events)
    }
}
