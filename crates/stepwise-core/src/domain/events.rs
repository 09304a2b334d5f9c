use crate::domain::flow_instance::{
    CorrelationId, FlowId, FlowInstanceId, FlowStatus, StepId, StepStatus,
};
use crate::domain::resume::ResumeReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic carrying [`FlowEvent`]s
pub const FLOW_EVENTS_TOPIC: &str = "flow.events";

/// Topic carrying [`EntityEvent`]s
pub const ENTITY_EVENTS_TOPIC: &str = "entity.events";

/// Domain events raised by flow instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// A flow instance was created
    FlowCreated {
        /// The flow instance
        flow_instance_id: FlowInstanceId,
        /// Its definition
        flow_id: FlowId,
        /// Its correlation ID
        correlation_id: CorrelationId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// A step instance changed status
    StepTransitioned {
        /// The flow instance
        flow_instance_id: FlowInstanceId,
        /// The step
        step_id: StepId,
        /// Previous status; `None` when the step instance was created
        from: Option<StepStatus>,
        /// New status
        to: StepStatus,
        /// Attempt count after the transition
        attempt: u32,
        /// Failure or cancellation reason
        reason: Option<String>,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// The overall flow status changed
    FlowStatusChanged {
        /// The flow instance
        flow_instance_id: FlowInstanceId,
        /// Previous status
        from: FlowStatus,
        /// New status
        to: FlowStatus,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// A resume request was admitted
    ResumeAdmitted {
        /// The flow instance
        flow_instance_id: FlowInstanceId,
        /// The resumed step
        step_id: StepId,
        /// Why it resumed
        reason: ResumeReason,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
}

impl FlowEvent {
    /// Returns the type of the event as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            FlowEvent::FlowCreated { .. } => "flow_instance.created",
            FlowEvent::StepTransitioned { .. } => "flow_instance.step_transitioned",
            FlowEvent::FlowStatusChanged { .. } => "flow_instance.status_changed",
            FlowEvent::ResumeAdmitted { .. } => "flow_instance.resume_admitted",
        }
    }

    /// Returns the flow instance ID this event is associated with
    pub fn flow_instance_id(&self) -> &FlowInstanceId {
        match self {
            FlowEvent::FlowCreated { flow_instance_id, .. }
            | FlowEvent::StepTransitioned { flow_instance_id, .. }
            | FlowEvent::FlowStatusChanged { flow_instance_id, .. }
            | FlowEvent::ResumeAdmitted { flow_instance_id, .. } => flow_instance_id,
        }
    }

    /// Returns the timestamp when the event occurred
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            FlowEvent::FlowCreated { timestamp, .. }
            | FlowEvent::StepTransitioned { timestamp, .. }
            | FlowEvent::FlowStatusChanged { timestamp, .. }
            | FlowEvent::ResumeAdmitted { timestamp, .. } => *timestamp,
        }
    }
}

/// Kind of business entity an [`EntityEvent`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A held asset
    Asset,
    /// A payment
    Payment,
    /// A subscription
    Subscription,
    /// A KYC verification
    KycVerification,
    /// A user notification
    Notification,
    /// A flow instance
    FlowInstance,
}

/// Create/update/delete notification for an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EntityEvent {
    /// The entity was created
    Created {
        /// Entity kind
        kind: EntityKind,
        /// Entity ID
        entity_id: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// The entity changed
    Updated {
        /// Entity kind
        kind: EntityKind,
        /// Entity ID
        entity_id: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
    /// The entity was removed
    Deleted {
        /// Entity kind
        kind: EntityKind,
        /// Entity ID
        entity_id: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
}

impl EntityEvent {
    /// Entity kind discriminator
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityEvent::Created { kind, .. }
            | EntityEvent::Updated { kind, .. }
            | EntityEvent::Deleted { kind, .. } => *kind,
        }
    }

    /// ID of the entity
    pub fn entity_id(&self) -> &str {
        match self {
            EntityEvent::Created { entity_id, .. }
            | EntityEvent::Updated { entity_id, .. }
            | EntityEvent::Deleted { entity_id, .. } => entity_id,
        }
    }
}

/// Where an external event should be delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTarget {
    /// A specific flow instance
    Instance(FlowInstanceId),
    /// Every instance carrying the correlation ID
    Correlation(CorrelationId),
}

/// Event raised outside the engine that may resume paused flows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    /// Event type, also the topic it is published on
    pub event_type: String,

    /// Delivery target
    pub target: EventTarget,

    /// Event data
    #[serde(default)]
    pub payload: Option<Value>,

    /// Producer of the event
    pub requested_by: String,
}

/// Envelope carried by the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum BusMessage {
    /// Flow lifecycle event
    Flow(FlowEvent),
    /// Entity notification
    Entity(EntityEvent),
    /// External event
    External(ExternalEvent),
}
