use crate::application::event_bus::EventBus;
use crate::application::timeout_scheduler::Clock;
use crate::config::PersistenceRetryConfig;
use crate::domain::events::{
    BusMessage, EntityEvent, EntityKind, FlowEvent, ENTITY_EVENTS_TOPIC, FLOW_EVENTS_TOPIC,
};
use crate::domain::flow_instance::FlowInstance;
use crate::domain::repository::PersistenceGateway;
use crate::CoreError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace, warn};

/// Persists flow instance snapshots and publishes their events afterwards
pub struct CheckpointWriter {
    gateway: Arc<dyn PersistenceGateway>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    retry: PersistenceRetryConfig,
}

impl CheckpointWriter {
    /// Create a writer
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        retry: PersistenceRetryConfig,
    ) -> Self {
        Self {
            gateway,
            bus,
            clock,
            retry,
        }
    }

    /// Bump the revision, save the snapshot, then publish pending events
    ///
    /// Transient persistence errors are retried with doubling backoff; any
    /// other error is returned immediately with the revision rolled back.
    pub async fn checkpoint(&self, instance: &mut FlowInstance) -> Result<(), CoreError> {
        instance.revision += 1;
        instance.updated_at = self.clock.now();

        if let Err(e) = self.save_with_retry(instance).await {
            instance.revision -= 1;
            error!(
                flow_instance_id = %instance.id,
                revision = instance.revision + 1,
                error = %e,
                "Checkpoint failed"
            );
            return Err(e);
        }

        trace!(flow_instance_id = %instance.id, revision = instance.revision, "Checkpoint saved");

        let events = instance.take_events();
        self.publish(&events).await;
        Ok(())
    }

    async fn save_with_retry(&self, instance: &FlowInstance) -> Result<(), CoreError> {
        let mut backoff = Duration::from_millis(self.retry.backoff_ms);
        let mut attempt = 1;

        loop {
            match self.gateway.save_checkpoint(instance).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(
                        flow_instance_id = %instance.id,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "Retrying checkpoint after persistence error"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn publish(&self, events: &[FlowEvent]) {
        for event in events {
            if let Err(e) = self
                .bus
                .publish(FLOW_EVENTS_TOPIC, BusMessage::Flow(event.clone()))
                .await
            {
                warn!(event_type = event.event_type(), error = %e, "Failed to publish flow event");
            }

            let entity_event = match event {
                FlowEvent::FlowCreated {
                    flow_instance_id,
                    timestamp,
                    ..
                } => Some(EntityEvent::Created {
                    kind: EntityKind::FlowInstance,
                    entity_id: flow_instance_id.0.clone(),
                    timestamp: *timestamp,
                }),
                FlowEvent::FlowStatusChanged {
                    flow_instance_id,
                    timestamp,
                    ..
                } => Some(EntityEvent::Updated {
                    kind: EntityKind::FlowInstance,
                    entity_id: flow_instance_id.0.clone(),
                    timestamp: *timestamp,
                }),
                _ => None,
            };

            if let Some(entity_event) = entity_event {
                if let Err(e) = self
                    .bus
                    .publish(ENTITY_EVENTS_TOPIC, BusMessage::Entity(entity_event))
                    .await
                {
                    warn!(error = %e, "Failed to publish entity event");
                }
            }
        }
    }
}
