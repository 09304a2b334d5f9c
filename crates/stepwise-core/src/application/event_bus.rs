use crate::domain::events::BusMessage;
use crate::CoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives messages published on a topic
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a message delivered on `topic`
    async fn handle(&self, topic: &str, message: BusMessage) -> Result<(), CoreError>;
}

/// Publish/subscribe with explicit topic registration
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Make a topic available; registering twice is a no-op
    fn register_topic(&self, topic: &str);

    /// Publish a message; delivery is the bus's concern
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), CoreError>;

    /// Subscribe a handler to a registered topic
    fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), CoreError>;
}

/// In-process event bus
///
/// Each delivery runs on its own task, so a slow subscriber never blocks
/// the publisher. Handler errors are logged and dropped.
#[derive(Default)]
pub struct InMemoryEventBus {
    topics: DashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl InMemoryEventBus {
    /// Create a bus with no topics
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the topic has been registered
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    fn register_topic(&self, topic: &str) {
        self.topics.entry(topic.to_string()).or_default();
    }

    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), CoreError> {
        let handlers = self
            .topics
            .get(topic)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                CoreError::ConfigurationError(format!("Topic not registered: {}", topic))
            })?;

        debug!(topic, subscribers = handlers.len(), "Publishing message");

        for handler in handlers {
            let topic = topic.to_string();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(&topic, message).await {
                    warn!(topic = %topic, error = %e, "Event handler failed");
                }
            });
        }

        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), CoreError> {
        let mut handlers = self.topics.get_mut(topic).ok_or_else(|| {
            CoreError::ConfigurationError(format!("Topic not registered: {}", topic))
        })?;
        handlers.push(handler);
        Ok(())
    }
}
