//! Engine metrics derived from published flow events.

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stepwise_core::domain::events::{ENTITY_EVENTS_TOPIC, FLOW_EVENTS_TOPIC};
use stepwise_core::{
    BusMessage, CoreError, EventBus, EventHandler, FlowEvent, FlowStatus, StepStatus,
};
use tracing::trace;

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Flow instances created
    pub flows_started: u64,
    /// Flows that reached `Completed`
    pub flows_completed: u64,
    /// Flows that reached `Failed`
    pub flows_failed: u64,
    /// Flows that reached `Cancelled`
    pub flows_cancelled: u64,
    /// Step status transitions
    pub step_transitions: u64,
    /// Failed step attempts
    pub step_failures: u64,
    /// Admitted resume requests
    pub resumes_admitted: u64,
    /// Entity notifications seen
    pub entity_events: u64,
}

/// Event bus subscriber that counts engine activity
///
/// Every event is recorded through the `metrics` facade and mirrored in
/// in-process counters readable with [`EngineMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct EngineMetrics {
    flows_started: AtomicU64,
    flows_completed: AtomicU64,
    flows_failed: AtomicU64,
    flows_cancelled: AtomicU64,
    step_transitions: AtomicU64,
    step_failures: AtomicU64,
    resumes_admitted: AtomicU64,
    entity_events: AtomicU64,
}

impl EngineMetrics {
    /// Create a recorder with zeroed counters
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to the engine's flow and entity topics
    pub fn attach(self: &Arc<Self>, bus: &dyn EventBus) -> Result<(), CoreError> {
        bus.subscribe(FLOW_EVENTS_TOPIC, self.clone())?;
        bus.subscribe(ENTITY_EVENTS_TOPIC, self.clone())
    }

    /// Record one flow event
    pub fn record(&self, event: &FlowEvent) {
        match event {
            FlowEvent::FlowCreated { flow_id, .. } => {
                self.flows_started.fetch_add(1, Ordering::Relaxed);
                counter!("stepwise_flows_started_total", 1, "flow_id" => flow_id.to_string());
            }
            FlowEvent::StepTransitioned { to, .. } => {
                self.step_transitions.fetch_add(1, Ordering::Relaxed);
                if *to == StepStatus::Failed {
                    self.step_failures.fetch_add(1, Ordering::Relaxed);
                }
                counter!("stepwise_step_transitions_total", 1, "to" => to.to_string());
            }
            FlowEvent::FlowStatusChanged { to, .. } => {
                let finished = match to {
                    FlowStatus::Completed => &self.flows_completed,
                    FlowStatus::Failed => &self.flows_failed,
                    FlowStatus::Cancelled => &self.flows_cancelled,
                    _ => return,
                };
                finished.fetch_add(1, Ordering::Relaxed);
                counter!("stepwise_flows_finished_total", 1, "status" => to.to_string());
            }
            FlowEvent::ResumeAdmitted { reason, .. } => {
                self.resumes_admitted.fetch_add(1, Ordering::Relaxed);
                counter!("stepwise_resumes_admitted_total", 1, "reason" => reason.to_string());
            }
        }
    }

    /// Current counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            flows_started: self.flows_started.load(Ordering::Relaxed),
            flows_completed: self.flows_completed.load(Ordering::Relaxed),
            flows_failed: self.flows_failed.load(Ordering::Relaxed),
            flows_cancelled: self.flows_cancelled.load(Ordering::Relaxed),
            step_transitions: self.step_transitions.load(Ordering::Relaxed),
            step_failures: self.step_failures.load(Ordering::Relaxed),
            resumes_admitted: self.resumes_admitted.load(Ordering::Relaxed),
            entity_events: self.entity_events.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventHandler for EngineMetrics {
    async fn handle(&self, topic: &str, message: BusMessage) -> Result<(), CoreError> {
        match message {
            BusMessage::Flow(event) => {
                trace!(topic, event_type = event.event_type(), "Recording flow event");
                self.record(&event);
            }
            BusMessage::Entity(event) => {
                self.entity_events.fetch_add(1, Ordering::Relaxed);
                let kind = format!("{:?}", event.kind());
                counter!("stepwise_entity_events_total", 1, "kind" => kind);
            }
            BusMessage::External(_) => {}
        }
        Ok(())
    }
}
