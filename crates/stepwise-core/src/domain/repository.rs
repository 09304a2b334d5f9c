//! Collaborator traits for persistence
//!
//! The engine never talks to a storage technology directly. Flow instance
//! checkpoints go through a [`PersistenceGateway`] and published
//! definitions through a [`FlowDefinitionRepository`]. External crates
//! implement these traits for their store of choice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::flow_definition::FlowDefinition;
use super::flow_instance::{CorrelationId, DeadlineKind, FlowId, FlowInstance, FlowInstanceId};
use crate::CoreError;

/// A deadline that has elapsed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DueTimeout {
    /// The waiting instance
    pub flow_instance_id: FlowInstanceId,

    /// What kind of deadline elapsed
    pub kind: DeadlineKind,

    /// When it was due
    pub due_at: DateTime<Utc>,
}

/// Durable store of flow instance checkpoints
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Load the latest checkpoint of an instance
    async fn load_instance(&self, id: &FlowInstanceId) -> Result<Option<FlowInstance>, CoreError>;

    /// Persist a full snapshot
    ///
    /// This is a compare-and-swap on `revision`: the stored revision must be
    /// exactly one less than the incoming one, or absent when the incoming
    /// revision is 1. Anything else fails with `ConcurrencyConflict`.
    async fn save_checkpoint(&self, instance: &FlowInstance) -> Result<(), CoreError>;

    /// Deadlines of non-terminal instances that elapsed at or before `now`
    async fn list_due_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<DueTimeout>, CoreError>;

    /// Every instance that is not in a terminal status
    async fn list_recoverable_instances(&self) -> Result<Vec<FlowInstance>, CoreError>;

    /// Instances carrying the correlation ID
    async fn find_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<FlowInstance>, CoreError>;
}

/// Store of published, immutable flow definitions
#[async_trait]
pub trait FlowDefinitionRepository: Send + Sync {
    /// Publish a definition; an existing `(id, version)` is never replaced
    async fn publish(&self, definition: FlowDefinition) -> Result<(), CoreError>;

    /// The highest published version of a flow
    async fn find_latest(&self, id: &FlowId) -> Result<Option<FlowDefinition>, CoreError>;

    /// A specific version of a flow
    async fn find_version(
        &self,
        id: &FlowId,
        version: u32,
    ) -> Result<Option<FlowDefinition>, CoreError>;

    /// IDs of every published flow
    async fn list(&self) -> Result<Vec<FlowId>, CoreError>;
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// In-memory checkpoint store
    ///
    /// Snapshots are stored as serialized JSON so that a reload behaves like
    /// a read from a real store.
    #[derive(Clone)]
    pub struct MemoryPersistenceGateway {
        collection: String,
        instances: Arc<DashMap<String, serde_json::Value>>,
    }

    impl MemoryPersistenceGateway {
        /// Create a gateway writing to `collection`
        pub fn new(collection: impl Into<String>) -> Self {
            Self {
                collection: collection.into(),
                instances: Arc::new(DashMap::with_capacity(64)),
            }
        }

        /// Name of the collection backing this gateway
        pub fn collection(&self) -> &str {
            &self.collection
        }

        /// Number of stored instances
        pub fn len(&self) -> usize {
            self.instances.len()
        }

        /// Whether nothing is stored
        pub fn is_empty(&self) -> bool {
            self.instances.is_empty()
        }

        fn decode(&self, value: &serde_json::Value) -> Result<FlowInstance, CoreError> {
            serde_json::from_value(value.clone()).map_err(|e| {
                CoreError::PersistenceError(format!(
                    "Corrupt snapshot in {}: {}",
                    self.collection, e
                ))
            })
        }

        fn all(&self) -> Result<Vec<FlowInstance>, CoreError> {
            self.instances
                .iter()
                .map(|entry| self.decode(entry.value()))
                .collect()
        }
    }

    impl Default for MemoryPersistenceGateway {
        fn default() -> Self {
            Self::new("flow_instances")
        }
    }

    #[async_trait]
    impl PersistenceGateway for MemoryPersistenceGateway {
        async fn load_instance(
            &self,
            id: &FlowInstanceId,
        ) -> Result<Option<FlowInstance>, CoreError> {
            self.instances
                .get(&id.0)
                .map(|entry| self.decode(entry.value()))
                .transpose()
        }

        async fn save_checkpoint(&self, instance: &FlowInstance) -> Result<(), CoreError> {
            if instance.revision == 0 {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "Instance {} has no revision",
                    instance.id
                )));
            }
            let snapshot = serde_json::to_value(instance)?;

            // The entry guard keeps the compare-and-swap atomic
            let entry = self.instances.entry(instance.id.0.clone());
            let stored_revision = match &entry {
                dashmap::mapref::entry::Entry::Occupied(occupied) => {
                    occupied.get().get("revision").and_then(|r| r.as_u64())
                }
                dashmap::mapref::entry::Entry::Vacant(_) => None,
            };

            let expected = instance.revision.checked_sub(1).filter(|r| *r > 0);
            if stored_revision != expected {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "Instance {} is at revision {:?}, checkpoint expects {:?}",
                    instance.id, stored_revision, expected
                )));
            }

            entry.insert(snapshot);
            Ok(())
        }

        async fn list_due_timeouts(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<DueTimeout>, CoreError> {
            let mut due: Vec<DueTimeout> = self
                .all()?
                .into_iter()
                .filter_map(|instance| {
                    instance
                        .pending_deadline()
                        .filter(|(_, due_at)| *due_at <= now)
                        .map(|(kind, due_at)| DueTimeout {
                            flow_instance_id: instance.id.clone(),
                            kind,
                            due_at,
                        })
                })
                .collect();
            due.sort_by_key(|d| d.due_at);
            Ok(due)
        }

        async fn list_recoverable_instances(&self) -> Result<Vec<FlowInstance>, CoreError> {
            let mut instances: Vec<FlowInstance> = self
                .all()?
                .into_iter()
                .filter(|instance| !instance.is_terminal())
                .collect();
            instances.sort_by_key(|i| i.created_at);
            Ok(instances)
        }

        async fn find_by_correlation(
            &self,
            correlation_id: &CorrelationId,
        ) -> Result<Vec<FlowInstance>, CoreError> {
            Ok(self
                .all()?
                .into_iter()
                .filter(|instance| &instance.correlation_id == correlation_id)
                .collect())
        }
    }

    /// In-memory definition store keyed by `(id, version)`
    #[derive(Clone)]
    pub struct MemoryFlowDefinitionRepository {
        collection: String,
        definitions: Arc<DashMap<String, BTreeMap<u32, FlowDefinition>>>,
    }

    impl MemoryFlowDefinitionRepository {
        /// Create a repository writing to `collection`
        pub fn new(collection: impl Into<String>) -> Self {
            Self {
                collection: collection.into(),
                definitions: Arc::new(DashMap::with_capacity(16)),
            }
        }

        /// Name of the collection backing this repository
        pub fn collection(&self) -> &str {
            &self.collection
        }
    }

    impl Default for MemoryFlowDefinitionRepository {
        fn default() -> Self {
            Self::new("flow_definitions")
        }
    }

    #[async_trait]
    impl FlowDefinitionRepository for MemoryFlowDefinitionRepository {
        async fn publish(&self, definition: FlowDefinition) -> Result<(), CoreError> {
            definition.validate()?;

            let mut versions = self.definitions.entry(definition.id.0.clone()).or_default();
            if versions.contains_key(&definition.version) {
                return Err(CoreError::ValidationError(format!(
                    "Flow {} version {} is already published",
                    definition.id, definition.version
                )));
            }
            versions.insert(definition.version, definition);
            Ok(())
        }

        async fn find_latest(&self, id: &FlowId) -> Result<Option<FlowDefinition>, CoreError> {
            Ok(self
                .definitions
                .get(&id.0)
                .and_then(|versions| versions.values().next_back().cloned()))
        }

        async fn find_version(
            &self,
            id: &FlowId,
            version: u32,
        ) -> Result<Option<FlowDefinition>, CoreError> {
            Ok(self
                .definitions
                .get(&id.0)
                .and_then(|versions| versions.get(&version).cloned()))
        }

        async fn list(&self) -> Result<Vec<FlowId>, CoreError> {
            let mut ids: Vec<FlowId> = self
                .definitions
                .iter()
                .map(|entry| FlowId(entry.key().clone()))
                .collect();
            ids.sort();
            Ok(ids)
        }
    }

}
