mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{counting_handler, noop_handler, Harness};
use mockall::{mock, Sequence};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use stepwise_core::application::checkpoint::CheckpointWriter;
use stepwise_core::domain::repository::DueTimeout;
use stepwise_core::{
    handler_fn, Clock, CoreError, CorrelationId, ExecutionResult, FlowContext, FlowDefinition,
    FlowId, FlowInstance, FlowInstanceId, FlowStatus, InMemoryEventBus, PersistenceGateway,
    PersistenceRetryConfig, RecoveryReport, ResumeRequest, StaticHandlerRegistry, StepDefinition,
    StepStatus, SystemClock, WaitSpec, WaitTimeoutAction,
};
use tokio::sync::Notify;

mock! {
    pub Gateway {}

    #[async_trait]
    impl PersistenceGateway for Gateway {
        async fn load_instance(
            &self,
            id: &FlowInstanceId,
        ) -> Result<Option<FlowInstance>, CoreError>;
        async fn save_checkpoint(&self, instance: &FlowInstance) -> Result<(), CoreError>;
        async fn list_due_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<DueTimeout>, CoreError>;
        async fn list_recoverable_instances(&self) -> Result<Vec<FlowInstance>, CoreError>;
        async fn find_by_correlation(
            &self,
            correlation_id: &CorrelationId,
        ) -> Result<Vec<FlowInstance>, CoreError>;
    }
}

fn writer(gateway: MockGateway) -> CheckpointWriter {
    CheckpointWriter::new(
        Arc::new(gateway),
        Arc::new(InMemoryEventBus::new()),
        Arc::new(SystemClock),
        PersistenceRetryConfig {
            max_attempts: 3,
            backoff_ms: 1,
        },
    )
}

fn fresh_instance() -> FlowInstance {
    FlowInstance::new(
        FlowId::from("payment"),
        1,
        FlowContext::new(),
        CorrelationId::generate(),
        Utc::now(),
    )
}

#[tokio::test]
async fn test_checkpoint_retries_transient_persistence_errors() {
    let mut gateway = MockGateway::new();
    let mut seq = Sequence::new();
    gateway
        .expect_save_checkpoint()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Err(CoreError::PersistenceError("connection reset".to_string())));
    gateway
        .expect_save_checkpoint()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|instance| instance.revision == 1)
        .returning(|_| Ok(()));

    let mut instance = fresh_instance();
    writer(gateway).checkpoint(&mut instance).await.unwrap();
    assert_eq!(instance.revision, 1);
    assert!(instance.events.is_empty());
}

#[tokio::test]
async fn test_checkpoint_gives_up_after_max_attempts() {
    let mut gateway = MockGateway::new();
    gateway
        .expect_save_checkpoint()
        .times(3)
        .returning(|_| Err(CoreError::PersistenceError("disk full".to_string())));

    let mut instance = fresh_instance();
    let result = writer(gateway).checkpoint(&mut instance).await;
    assert!(matches!(result, Err(CoreError::PersistenceError(_))));
    assert_eq!(instance.revision, 0);
    assert!(!instance.events.is_empty());
}

#[tokio::test]
async fn test_checkpoint_does_not_retry_conflicts() {
    let mut gateway = MockGateway::new();
    gateway
        .expect_save_checkpoint()
        .times(1)
        .returning(|_| Err(CoreError::ConcurrencyConflict("stale revision".to_string())));

    let mut instance = fresh_instance();
    let result = writer(gateway).checkpoint(&mut instance).await;
    assert!(matches!(result, Err(CoreError::ConcurrencyConflict(_))));
    assert_eq!(instance.revision, 0);
}

#[tokio::test]
async fn test_recovery_does_not_repeat_completed_steps() {
    let definition = FlowDefinition::builder("subscription")
        .step(StepDefinition::builder("reserve", "reserve").build().unwrap())
        .step(
            StepDefinition::builder("provision", "provision")
                .max_attempts(2)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let reservations = Arc::new(AtomicU32::new(0));
    let started = Arc::new(Notify::new());
    let handler_started = started.clone();
    let handlers = StaticHandlerRegistry::new()
        .register("reserve", counting_handler(reservations.clone(), FlowContext::new()))
        .register(
            "provision",
            handler_fn(move |_, _| {
                let started = handler_started.clone();
                async move {
                    started.notify_one();
                    std::future::pending::<()>().await;
                    ExecutionResult::Success(FlowContext::new())
                }
            }),
        );

    let harness = Harness::new(definition, handlers).await;
    let id = harness
        .orchestrator
        .start_flow(&"subscription".into(), FlowContext::new())
        .await
        .unwrap();

    // Simulate a crash while the second step's handler is running
    let orchestrator = harness.orchestrator.clone();
    let advance_id = id.clone();
    let crashed = tokio::spawn(async move { orchestrator.advance_instance(&advance_id).await });
    started.notified().await;
    crashed.abort();
    let _ = crashed.await;

    let stored = harness.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(stored.status, FlowStatus::InProgress);
    assert_eq!(stored.steps[1].status, StepStatus::InProgress);

    let provisions = Arc::new(AtomicU32::new(0));
    let restarted = harness.restart(
        StaticHandlerRegistry::new()
            .register("reserve", counting_handler(reservations.clone(), FlowContext::new()))
            .register("provision", counting_handler(provisions.clone(), FlowContext::new())),
    );

    let report = restarted.recover().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            readmitted: 1,
            interrupted: 1,
            waiting: 0,
            failed: 0,
        }
    );
    restarted.run_pending().await;

    let instance = restarted.get_status(&id).await.unwrap();
    assert_eq!(instance.status, FlowStatus::Completed);
    assert_eq!(reservations.load(Ordering::SeqCst), 1);
    assert_eq!(provisions.load(Ordering::SeqCst), 1);

    let provision = &instance.steps[1];
    assert_eq!(provision.attempt_count, 2);
    assert_eq!(
        provision.history,
        vec![
            StepStatus::Pending,
            StepStatus::InProgress,
            StepStatus::Failed,
            StepStatus::InProgress,
            StepStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn test_recovery_reschedules_wait_deadlines() {
    let definition = FlowDefinition::builder("kyc")
        .step(
            StepDefinition::builder("await_documents", "review")
                .wait(
                    WaitSpec::event("documents.uploaded")
                        .with_timeout(60_000, WaitTimeoutAction::Fail),
                )
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let harness = Harness::new(
        definition,
        StaticHandlerRegistry::new().register("review", noop_handler()),
    )
    .await;
    let id = harness
        .orchestrator
        .start_flow(&"kyc".into(), FlowContext::new())
        .await
        .unwrap();
    harness.orchestrator.run_pending().await;

    let restarted =
        harness.restart(StaticHandlerRegistry::new().register("review", noop_handler()));
    let report = restarted.recover().await.unwrap();
    assert_eq!(report.waiting, 1);
    assert_eq!(report.interrupted, 0);
    assert_eq!(restarted.scheduler().len(), 1);
    assert_eq!(restarted.queued(), 0);

    let admitted = restarted
        .resume_flow(ResumeRequest::event(id.clone(), "documents.uploaded", None))
        .await
        .unwrap();
    assert!(admitted.is_admitted());
    assert!(restarted.scheduler().is_empty());

    restarted.run_pending().await;
    assert_eq!(
        restarted.get_status(&id).await.unwrap().status,
        FlowStatus::Completed
    );
}

#[tokio::test]
async fn test_recovery_readmits_unstarted_flows() {
    let definition = FlowDefinition::builder("payment")
        .step(StepDefinition::builder("charge", "charge").build().unwrap())
        .build()
        .unwrap();
    let harness = Harness::new(
        definition,
        StaticHandlerRegistry::new().register("charge", noop_handler()),
    )
    .await;

    let id = harness
        .orchestrator
        .start_flow(&"payment".into(), FlowContext::new())
        .await
        .unwrap();

    let restarted =
        harness.restart(StaticHandlerRegistry::new().register("charge", noop_handler()));
    let report = restarted.recover().await.unwrap();
    assert_eq!(report.readmitted, 1);

    restarted.run_pending().await;
    assert_eq!(
        restarted.get_status(&id).await.unwrap().status,
        FlowStatus::Completed
    );
}

#[tokio::test]
async fn test_recovery_continues_past_unrecoverable_instances() {
    let definition = FlowDefinition::builder("payment")
        .step(StepDefinition::builder("charge", "charge").build().unwrap())
        .build()
        .unwrap();
    let harness = Harness::new(
        definition,
        StaticHandlerRegistry::new().register("charge", noop_handler()),
    )
    .await;

    // Its definition version was never published
    let mut orphan = FlowInstance::new(
        FlowId::from("payment"),
        99,
        FlowContext::new(),
        CorrelationId::generate(),
        harness.clock.now() - chrono::Duration::hours(1),
    );
    orphan.revision = 1;
    harness.gateway.save_checkpoint(&orphan).await.unwrap();

    let id = harness
        .orchestrator
        .start_flow(&"payment".into(), FlowContext::new())
        .await
        .unwrap();

    let restarted =
        harness.restart(StaticHandlerRegistry::new().register("charge", noop_handler()));
    let report = restarted.recover().await.unwrap();
    assert_eq!(report.readmitted, 1);
    assert_eq!(report.failed, 1);

    restarted.run_pending().await;
    assert_eq!(
        restarted.get_status(&id).await.unwrap().status,
        FlowStatus::Completed
    );
    assert_eq!(
        restarted.get_status(&orphan.id).await.unwrap().status,
        FlowStatus::Pending
    );
}
