use crate::domain::flow_instance::FlowInstanceId;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Why a paused flow should resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeReason {
    /// Operator request
    Manual,
    /// External event delivery
    Event,
    /// Re-evaluate the step's resume condition
    Condition,
    /// A wait deadline elapsed
    Timeout,
    /// Engine-internal request
    System,
}

impl fmt::Display for ResumeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResumeReason::Manual => "manual",
            ResumeReason::Event => "event",
            ResumeReason::Condition => "condition",
            ResumeReason::Timeout => "timeout",
            ResumeReason::System => "system",
        };
        f.write_str(name)
    }
}

/// Request to re-admit a paused flow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
    /// Target flow instance
    pub flow_instance_id: FlowInstanceId,

    /// Why the flow should resume
    pub reason: ResumeReason,

    /// Event type, required for `Event` requests
    #[serde(default)]
    pub event_type: Option<String>,

    /// Event data merged into the context on admission
    #[serde(default)]
    pub payload: Option<Value>,

    /// Who asked for the resume
    pub requested_by: String,

    /// When the resume was requested
    pub requested_at: DateTime<Utc>,
}

impl ResumeRequest {
    /// Start building a request
    pub fn builder(flow_instance_id: FlowInstanceId, reason: ResumeReason) -> ResumeRequestBuilder {
        ResumeRequestBuilder {
            flow_instance_id,
            reason,
            event_type: None,
            payload: None,
            requested_by: None,
            requested_at: None,
        }
    }

    /// Manual resume by an operator
    pub fn manual(flow_instance_id: FlowInstanceId, requested_by: impl Into<String>) -> Self {
        Self::new(flow_instance_id, ResumeReason::Manual, requested_by.into())
    }

    /// Resume by an external event
    pub fn event(
        flow_instance_id: FlowInstanceId,
        event_type: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        let mut request = Self::new(flow_instance_id, ResumeReason::Event, "event-bus".to_string());
        request.event_type = Some(event_type.into());
        request.payload = payload;
        request
    }

    /// Ask the engine to re-check the step's resume condition
    pub fn condition(flow_instance_id: FlowInstanceId) -> Self {
        Self::new(flow_instance_id, ResumeReason::Condition, "engine".to_string())
    }

    /// Raised when a wait deadline elapses
    pub fn timeout(flow_instance_id: FlowInstanceId) -> Self {
        Self::new(flow_instance_id, ResumeReason::Timeout, "timeout-scheduler".to_string())
    }

    /// Engine-internal resume
    pub fn system(flow_instance_id: FlowInstanceId) -> Self {
        Self::new(flow_instance_id, ResumeReason::System, "engine".to_string())
    }

    fn new(flow_instance_id: FlowInstanceId, reason: ResumeReason, requested_by: String) -> Self {
        Self {
            flow_instance_id,
            reason,
            event_type: None,
            payload: None,
            requested_by,
            requested_at: Utc::now(),
        }
    }
}

/// Builder for [`ResumeRequest`]
#[derive(Debug)]
pub struct ResumeRequestBuilder {
    flow_instance_id: FlowInstanceId,
    reason: ResumeReason,
    event_type: Option<String>,
    payload: Option<Value>,
    requested_by: Option<String>,
    requested_at: Option<DateTime<Utc>>,
}

impl ResumeRequestBuilder {
    /// Set the event type
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Set the payload
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the requester
    pub fn requested_by(mut self, requested_by: impl Into<String>) -> Self {
        self.requested_by = Some(requested_by.into());
        self
    }

    /// Set the request time
    pub fn requested_at(mut self, requested_at: DateTime<Utc>) -> Self {
        self.requested_at = Some(requested_at);
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<ResumeRequest, CoreError> {
        let requested_by = self.requested_by.ok_or_else(|| {
            CoreError::ValidationError("Resume request requires a requester".to_string())
        })?;
        if requested_by.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "Resume request requires a requester".to_string(),
            ));
        }

        if self.reason == ResumeReason::Event
            && self.event_type.as_deref().map_or(true, |t| t.trim().is_empty())
        {
            return Err(CoreError::ValidationError(
                "Event resume requests require an event type".to_string(),
            ));
        }

        Ok(ResumeRequest {
            flow_instance_id: self.flow_instance_id,
            reason: self.reason,
            event_type: self.event_type,
            payload: self.payload,
            requested_by,
            requested_at: self.requested_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Result of a resume request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// The instance was re-admitted to the work queue
    Admitted,

    /// The resume condition is false; the instance stays paused
    Gated,

    /// The request does not apply to what the step waits for
    Rejected {
        /// Why the request was rejected
        reason: String,
    },
}

impl ResumeOutcome {
    /// Whether the instance was re-admitted
    pub fn is_admitted(&self) -> bool {
        matches!(self, ResumeOutcome::Admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_requires_event_type() {
        let id = FlowInstanceId::from("i1");
        let result = ResumeRequest::builder(id.clone(), ResumeReason::Event)
            .requested_by("webhook")
            .build();
        assert!(matches!(result, Err(CoreError::ValidationError(_))));

        let request = ResumeRequest::builder(id, ResumeReason::Event)
            .event_type("kyc.approved")
            .payload(json!({"level": 2}))
            .requested_by("webhook")
            .build()
            .unwrap();
        assert_eq!(request.event_type.as_deref(), Some("kyc.approved"));
        assert_eq!(request.payload, Some(json!({"level": 2})));
    }

    #[test]
    fn test_builder_requires_requester() {
        let result =
            ResumeRequest::builder(FlowInstanceId::from("i1"), ResumeReason::Manual).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_constructors() {
        let id = FlowInstanceId::from("i1");
        assert_eq!(ResumeRequest::manual(id.clone(), "ops").reason, ResumeReason::Manual);
        assert_eq!(ResumeRequest::timeout(id.clone()).reason, ResumeReason::Timeout);
        assert_eq!(ResumeRequest::condition(id.clone()).requested_by, "engine");

        let event = ResumeRequest::event(id, "payment.settled", None);
        assert_eq!(event.reason, ResumeReason::Event);
        assert_eq!(event.event_type.as_deref(), Some("payment.settled"));
    }

    #[test]
    fn test_outcome_serialization() {
        let rejected = ResumeOutcome::Rejected {
            reason: "event type mismatch".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&rejected).unwrap(),
            json!({"outcome": "rejected", "reason": "event type mismatch"})
        );
        assert!(ResumeOutcome::Admitted.is_admitted());
        assert!(!ResumeOutcome::Gated.is_admitted());
    }
}
