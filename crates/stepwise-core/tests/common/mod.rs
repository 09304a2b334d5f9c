//! Shared fixtures for the flow engine integration tests
#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::domain::repository::memory::{
    MemoryFlowDefinitionRepository, MemoryPersistenceGateway,
};
use stepwise_core::{
    handler_fn, EngineConfig, ExecutionResult, FlowContext, FlowDefinition,
    FlowDefinitionRepository, FlowInstanceId, FlowOrchestrator, ManualClock, RetryPolicy,
    StaticHandlerRegistry, StepHandler,
};
use tracing_subscriber::{fmt, EnvFilter};

/// Route engine logs to the test writer
pub fn init_test_tracing() {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("stepwise_core=debug".parse().unwrap()),
        )
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// An orchestrator over in-memory collaborators
pub struct Harness {
    pub orchestrator: Arc<FlowOrchestrator>,
    pub gateway: Arc<MemoryPersistenceGateway>,
    pub definitions: Arc<MemoryFlowDefinitionRepository>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    /// Publish `definition` and build an orchestrator with immediate retries
    pub async fn new(definition: FlowDefinition, handlers: StaticHandlerRegistry) -> Self {
        Self::with_config(definition, handlers, test_config()).await
    }

    /// Publish `definition` and build an orchestrator with `config`
    pub async fn with_config(
        definition: FlowDefinition,
        handlers: StaticHandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        init_test_tracing();

        let gateway = Arc::new(MemoryPersistenceGateway::new(config.instances_collection.clone()));
        let definitions = Arc::new(MemoryFlowDefinitionRepository::new(
            config.definitions_collection.clone(),
        ));
        definitions.publish(definition).await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));

        let orchestrator = FlowOrchestrator::builder()
            .gateway(gateway.clone())
            .definitions(definitions.clone())
            .handlers(Arc::new(handlers))
            .clock(clock.clone())
            .config(config)
            .build()
            .unwrap();

        Self {
            orchestrator: Arc::new(orchestrator),
            gateway,
            definitions,
            clock,
        }
    }

    /// A second orchestrator over the same storage, as after a restart
    pub fn restart(&self, handlers: StaticHandlerRegistry) -> Arc<FlowOrchestrator> {
        Arc::new(
            FlowOrchestrator::builder()
                .gateway(self.gateway.clone())
                .definitions(self.definitions.clone())
                .handlers(Arc::new(handlers))
                .clock(self.clock.clone())
                .config(test_config())
                .build()
                .unwrap(),
        )
    }

    /// Wait until some queued work shows up, for asynchronous deliveries
    pub async fn wait_for_queued(&self) {
        for _ in 0..200 {
            if self.orchestrator.queued() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("nothing was queued");
    }

    /// Start a flow and drain the work queue
    pub async fn start_and_run(&self, flow_id: &str, context: FlowContext) -> FlowInstanceId {
        let id = self
            .orchestrator
            .start_flow(&flow_id.into(), context)
            .await
            .unwrap();
        self.orchestrator.run_pending().await;
        id
    }
}

/// Engine config with immediate retries so tests stay deterministic
pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::Immediate,
        lock_wait_ms: 500,
        handler_grace_period_ms: 100,
        ..EngineConfig::default()
    }
}

/// Handler that records its invocations and returns `output`
pub fn counting_handler(calls: Arc<AtomicU32>, output: FlowContext) -> Arc<dyn StepHandler> {
    handler_fn(move |_, _| {
        let calls = calls.clone();
        let output = output.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            ExecutionResult::Success(output)
        }
    })
}

/// Handler that succeeds with no output
pub fn noop_handler() -> Arc<dyn StepHandler> {
    handler_fn(|_, _| async { ExecutionResult::Success(FlowContext::new()) })
}
