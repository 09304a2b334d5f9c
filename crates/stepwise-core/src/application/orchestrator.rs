//! Top-level driver of flow instances
//!
//! The orchestrator owns the work queue, the per-instance locks and the
//! timeout scheduler. Every instance it advances is loaded under its lock,
//! moved through its definition one transition at a time, and checkpointed
//! after each transition before anything else happens to it.

use crate::application::checkpoint::CheckpointWriter;
use crate::application::dispatch::{InstanceLocks, WorkQueue};
use crate::application::event_bus::{EventBus, EventHandler, InMemoryEventBus};
use crate::application::handler::{HandlerRegistry, StepInvocation};
use crate::application::resume_coordinator::ResumeCoordinator;
use crate::application::step_executor::StepExecutor;
use crate::application::timeout_scheduler::{Clock, SystemClock, TimeoutScheduler};
use crate::config::EngineConfig;
use crate::domain::condition::{ConditionEvaluator, JmesPathConditionEvaluator};
use crate::domain::events::{BusMessage, EventTarget, ENTITY_EVENTS_TOPIC, FLOW_EVENTS_TOPIC};
use crate::domain::flow_definition::{FlowDefinition, StepDefinition};
use crate::domain::flow_instance::{
    CorrelationId, DeadlineKind, FlowId, FlowInstance, FlowInstanceId, FlowStatus, StepId,
    StepStatus, WaitState,
};
use crate::domain::repository::{FlowDefinitionRepository, PersistenceGateway};
use crate::domain::resume::{ResumeOutcome, ResumeRequest};
use crate::domain::state_machine::FlowStateMachine;
use crate::types::FlowContext;
use crate::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Flow-level failure reason when a flow creates too many step instances
pub const STEP_LIMIT_REASON: &str = "step limit exceeded";

/// Failure reason of a step found running after a restart
pub const INTERRUPTED_REASON: &str = "interrupted";

/// Outcome of [`FlowOrchestrator::recover`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Instances put back on the work queue
    pub readmitted: usize,
    /// Instances whose running step was failed as interrupted
    pub interrupted: usize,
    /// Instances waiting on a resume or a deadline
    pub waiting: usize,
    /// Instances that could not be recovered
    pub failed: usize,
}

/// What the advancement loop does next with an instance
#[derive(Debug, Clone, PartialEq, Eq)]
enum NextAction {
    /// Create a step instance
    Start(StepId),
    /// Evaluate the skip condition of a pending step
    Begin,
    /// Pause on the step's definition-level wait
    Gate,
    /// Run the step's handler
    Execute,
    /// Re-enter a failed step
    Retry,
    /// Hand the instance back to storage until a resume or deadline
    Release,
    /// Nothing left to do
    Done,
}

/// The flow engine's public surface
pub struct FlowOrchestrator {
    gateway: Arc<dyn PersistenceGateway>,
    definitions: Arc<dyn FlowDefinitionRepository>,
    handlers: Arc<dyn HandlerRegistry>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    evaluator: Arc<dyn ConditionEvaluator>,
    config: EngineConfig,
    executor: Arc<StepExecutor>,
    coordinator: Arc<ResumeCoordinator>,
    checkpoints: Arc<CheckpointWriter>,
    scheduler: Arc<TimeoutScheduler>,
    queue: Arc<WorkQueue>,
    locks: Arc<InstanceLocks>,
    running: DashMap<FlowInstanceId, CancellationToken>,
}

impl FlowOrchestrator {
    /// Start building an orchestrator
    pub fn builder() -> FlowOrchestratorBuilder {
        FlowOrchestratorBuilder::default()
    }

    /// Engine configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Event bus the engine publishes to
    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    /// Deadline index of the engine
    pub fn scheduler(&self) -> &TimeoutScheduler {
        &self.scheduler
    }

    /// Number of instances waiting on the work queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Start a flow with a generated correlation ID
    pub async fn start_flow(
        &self,
        flow_id: &FlowId,
        initial_context: FlowContext,
    ) -> Result<FlowInstanceId, CoreError> {
        self.start_flow_with_correlation(flow_id, initial_context, None)
            .await
    }

    /// Start a flow of the latest published definition
    ///
    /// Fails with `ValidationError` when the definition does not exist, a
    /// required context key is missing, or a step handler cannot be resolved.
    pub async fn start_flow_with_correlation(
        &self,
        flow_id: &FlowId,
        initial_context: FlowContext,
        correlation_id: Option<CorrelationId>,
    ) -> Result<FlowInstanceId, CoreError> {
        let definition = self
            .definitions
            .find_latest(flow_id)
            .await?
            .ok_or_else(|| {
                CoreError::ValidationError(format!("Flow definition not found: {}", flow_id))
            })?;

        if let Some(missing) = definition
            .required_context
            .iter()
            .find(|key| !initial_context.contains_key(key))
        {
            return Err(CoreError::ValidationError(format!(
                "Flow {} requires context key: {}",
                flow_id, missing
            )));
        }

        for step in &definition.steps {
            self.handlers.resolve(&step.handler).map_err(|_| {
                CoreError::ValidationError(format!(
                    "Step {} references unknown handler: {}",
                    step.id, step.handler
                ))
            })?;
        }

        let mut instance = FlowInstance::new(
            definition.id.clone(),
            definition.version,
            initial_context,
            correlation_id.unwrap_or_else(CorrelationId::generate),
            self.clock.now(),
        );
        self.checkpoints.checkpoint(&mut instance).await?;
        self.queue.enqueue(instance.id.clone());

        info!(
            flow_instance_id = %instance.id,
            flow_id = %definition.id,
            version = definition.version,
            correlation_id = %instance.correlation_id,
            "Flow started"
        );
        Ok(instance.id)
    }

    /// Ask a paused flow to resume
    pub async fn resume_flow(&self, request: ResumeRequest) -> Result<ResumeOutcome, CoreError> {
        self.coordinator.resume(request).await
    }

    /// Snapshot of an instance; never mutates it
    pub async fn get_status(&self, id: &FlowInstanceId) -> Result<FlowInstance, CoreError> {
        self.load(id).await
    }

    /// Force a flow into `Cancelled`
    ///
    /// A handler running for the instance is signalled to stop. Cancelling
    /// an instance that is already terminal fails with
    /// `TerminalStateViolation`, unless this cancel caused it.
    pub async fn cancel_flow(&self, id: &FlowInstanceId) -> Result<(), CoreError> {
        let snapshot = self.load(id).await?;
        if snapshot.is_terminal() {
            return Err(CoreError::TerminalStateViolation(format!(
                "Flow instance {} is {}",
                id, snapshot.status
            )));
        }

        self.running
            .entry(id.clone())
            .or_insert_with(CancellationToken::new)
            .cancel();

        let acquired = self.locks.acquire(id, self.config.lock_wait()).await;
        // A stale cancelled token would cancel the next advance
        self.running.remove(id);
        let _guard = acquired?;

        let mut instance = self.load(id).await?;
        if instance.is_terminal() {
            return match instance.status {
                FlowStatus::Cancelled => Ok(()),
                status => Err(CoreError::TerminalStateViolation(format!(
                    "Flow instance {} is {}",
                    id, status
                ))),
            };
        }

        let definition = self.definition_for(&instance).await?;
        FlowStateMachine::cancel(&mut instance, &definition, "cancelled", self.clock.now())?;
        self.checkpoints.checkpoint(&mut instance).await?;
        self.scheduler.cancel(id);

        info!(flow_instance_id = %id, "Flow cancelled");
        Ok(())
    }

    /// Drive one instance until it pauses, waits for a retry or terminates
    pub async fn advance_instance(&self, id: &FlowInstanceId) -> Result<FlowStatus, CoreError> {
        let guard = self.locks.acquire(id, self.config.lock_wait()).await?;
        let token = self
            .running
            .entry(id.clone())
            .or_insert_with(CancellationToken::new)
            .clone();

        let result = self.drive(id, &token).await;

        self.running.remove(id);
        drop(guard);

        if let Ok(status) = &result {
            if status.is_terminal() {
                self.locks.forget(id);
            }
        }
        result
    }

    /// Advance every queued instance on the calling task
    ///
    /// Returns how many queue entries were processed. Failures are logged;
    /// the instance stays at its last checkpoint.
    pub async fn run_pending(&self) -> usize {
        let mut processed = 0;
        while let Some(id) = self.queue.try_next() {
            processed += 1;
            if let Err(e) = self.advance_instance(&id).await {
                error!(flow_instance_id = %id, error = %e, "Failed to advance flow instance");
            }
        }
        processed
    }

    /// Fire every elapsed deadline
    ///
    /// Wait deadlines become `Timeout` resume requests; retry deadlines put
    /// the instance back on the work queue.
    pub async fn tick_timers(&self) -> usize {
        let now = self.clock.now();
        let mut due = self.scheduler.take_due(now);
        match self.gateway.list_due_timeouts(now).await {
            Ok(stored) => due.extend(stored),
            Err(e) => warn!(error = %e, "Failed to list due timeouts"),
        }

        let mut seen = HashSet::new();
        let mut fired = 0;
        for timeout in due {
            if !seen.insert(timeout.flow_instance_id.clone()) {
                continue;
            }
            fired += 1;

            match timeout.kind {
                DeadlineKind::RetryDue => {
                    debug!(flow_instance_id = %timeout.flow_instance_id, "Retry due");
                    self.queue.enqueue(timeout.flow_instance_id);
                }
                DeadlineKind::WaitDeadline => {
                    let id = timeout.flow_instance_id.clone();
                    match self.coordinator.resume(ResumeRequest::timeout(id.clone())).await {
                        Ok(outcome) => {
                            debug!(flow_instance_id = %id, ?outcome, "Wait deadline fired")
                        }
                        Err(e) => {
                            debug!(flow_instance_id = %id, error = %e, "Wait deadline not applied")
                        }
                    }
                }
            }
        }
        fired
    }

    /// Reload every non-terminal instance after a restart
    ///
    /// A step found `InProgress` may or may not have finished before the
    /// crash, so it is failed as interrupted and goes through the ordinary
    /// retry rule. Paused instances get their deadlines re-registered. An
    /// instance that cannot be recovered is logged and counted as failed;
    /// the others are still recovered.
    pub async fn recover(&self) -> Result<RecoveryReport, CoreError> {
        let mut report = RecoveryReport::default();

        for snapshot in self.gateway.list_recoverable_instances().await? {
            let id = snapshot.id;
            if let Err(e) = self.recover_instance(&id, &mut report).await {
                error!(flow_instance_id = %id, error = %e, "Failed to recover flow instance");
                report.failed += 1;
            }
        }

        info!(
            readmitted = report.readmitted,
            interrupted = report.interrupted,
            waiting = report.waiting,
            failed = report.failed,
            "Recovery finished"
        );
        Ok(report)
    }

    async fn recover_instance(
        &self,
        id: &FlowInstanceId,
        report: &mut RecoveryReport,
    ) -> Result<(), CoreError> {
        let _guard = self.locks.acquire(id, self.config.lock_wait()).await?;

        let mut instance = self.load(id).await?;
        if instance.is_terminal() {
            return Ok(());
        }
        let definition = self.definition_for(&instance).await?;

        let running_step = instance
            .latest_step()
            .filter(|s| s.status == StepStatus::InProgress)
            .map(|s| s.step_id.clone());
        if let Some(step_id) = running_step {
            let step = definition.require_step(&step_id)?;
            self.executor.record_failure(
                &mut instance,
                &definition,
                step,
                CoreError::HandlerExecutionError(INTERRUPTED_REASON.to_string()),
                self.clock.now(),
            )?;
            self.checkpoints.checkpoint(&mut instance).await?;
            report.interrupted += 1;
            warn!(
                flow_instance_id = %id,
                step_id = %step_id,
                "Step interrupted by restart"
            );
        }

        if instance.is_terminal() {
            return Ok(());
        }

        match instance.pending_deadline() {
            Some((kind, deadline)) => {
                self.scheduler.schedule_at(id, kind, deadline);
                report.waiting += 1;
            }
            None if instance.status == FlowStatus::Paused => report.waiting += 1,
            None => {
                self.queue.enqueue(id.clone());
                report.readmitted += 1;
            }
        }
        Ok(())
    }

    /// Deliver external events of `event_type` as event resume requests
    pub fn subscribe_external_events(&self, event_type: &str) -> Result<(), CoreError> {
        self.bus.register_topic(event_type);
        self.bus.subscribe(
            event_type,
            Arc::new(ExternalEventForwarder {
                gateway: self.gateway.clone(),
                coordinator: self.coordinator.clone(),
            }),
        )
    }

    /// Start the worker pool and the timer loop
    ///
    /// Both stop when `shutdown` fires; the returned task finishes once
    /// in-flight instances are released.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            let timer = {
                let orchestrator = orchestrator.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { orchestrator.timer_loop(shutdown).await })
            };

            let workers = orchestrator.config.worker_count;
            let semaphore = Arc::new(Semaphore::new(workers));
            info!(workers, "Flow orchestrator started");

            loop {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let id = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    id = orchestrator.queue.next() => match id {
                        Some(id) => id,
                        None => break,
                    },
                };

                let worker = orchestrator.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = worker.advance_instance(&id).await {
                        error!(
                            flow_instance_id = %id,
                            error = %e,
                            "Failed to advance flow instance"
                        );
                    }
                });
            }

            // Wait for in-flight workers to hand their permits back
            let _ = semaphore.acquire_many(workers as u32).await;
            if let Err(e) = timer.await {
                warn!(error = %e, "Timer loop ended abnormally");
            }
            info!("Flow orchestrator stopped");
        })
    }

    async fn timer_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.timer_poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick_timers().await;
                }
            }
        }
    }

    async fn drive(
        &self,
        id: &FlowInstanceId,
        token: &CancellationToken,
    ) -> Result<FlowStatus, CoreError> {
        let mut instance = self.load(id).await?;
        let definition = self.definition_for(&instance).await?;

        loop {
            let now = self.clock.now();

            if token.is_cancelled() && !instance.is_terminal() {
                FlowStateMachine::cancel(&mut instance, &definition, "cancelled", now)?;
                self.checkpoints.checkpoint(&mut instance).await?;
                info!(flow_instance_id = %id, "Flow cancelled");
                break;
            }

            let action = Self::next_action(&instance, &definition, now)?;
            debug!(flow_instance_id = %id, ?action, status = %instance.status, "Advancing");

            match action {
                NextAction::Start(step_id) => {
                    if instance.steps.len() >= self.config.max_step_instances {
                        warn!(
                            flow_instance_id = %id,
                            limit = self.config.max_step_instances,
                            "Step limit exceeded"
                        );
                        instance.error = Some(STEP_LIMIT_REASON.to_string());
                    } else {
                        FlowStateMachine::begin_step(&mut instance, &definition, &step_id, now)?;
                    }
                    FlowStateMachine::sync_flow_status(&mut instance, &definition, now)?;
                }
                NextAction::Begin => self.begin(&mut instance, &definition, now).await?,
                NextAction::Gate => {
                    let step = Self::current_definition(&instance, &definition)?;
                    let wait = match &step.wait {
                        Some(wait) => Some(WaitState::from_spec(wait, now)?),
                        None => None,
                    };
                    FlowStateMachine::transition_step(
                        &mut instance,
                        step,
                        StepStatus::Paused,
                        None,
                        now,
                    )?;
                    if let Some(record) = instance.latest_step_mut() {
                        record.wait = wait;
                    }
                    FlowStateMachine::sync_flow_status(&mut instance, &definition, now)?;
                }
                NextAction::Execute => self.execute(&mut instance, &definition, token).await?,
                NextAction::Retry => {
                    let step = Self::current_definition(&instance, &definition)?;
                    FlowStateMachine::transition_step(
                        &mut instance,
                        step,
                        StepStatus::InProgress,
                        None,
                        now,
                    )?;
                    FlowStateMachine::sync_flow_status(&mut instance, &definition, now)?;
                }
                NextAction::Release => {
                    if let Some((kind, deadline)) = instance.pending_deadline() {
                        self.scheduler.schedule_at(id, kind, deadline);
                    }
                    break;
                }
                NextAction::Done => break,
            }

            self.checkpoints.checkpoint(&mut instance).await?;
        }

        if instance.is_terminal() {
            self.scheduler.cancel(id);
            info!(
                flow_instance_id = %id,
                status = %instance.status,
                steps = instance.steps.len(),
                "Flow finished"
            );
        }
        Ok(instance.status)
    }

    fn next_action(
        instance: &FlowInstance,
        definition: &FlowDefinition,
        now: DateTime<Utc>,
    ) -> Result<NextAction, CoreError> {
        if instance.is_terminal() {
            return Ok(NextAction::Done);
        }

        let Some(step) = instance.latest_step() else {
            let first = definition.first_step().ok_or_else(|| {
                CoreError::ValidationError(format!("Flow {} has no steps", definition.id))
            })?;
            return Ok(NextAction::Start(first.id.clone()));
        };
        let step_definition = definition.require_step(&step.step_id)?;

        let action = match step.status {
            StepStatus::Pending => NextAction::Begin,
            StepStatus::InProgress if step_definition.wait.is_some() && !step.gate_passed => {
                NextAction::Gate
            }
            StepStatus::InProgress => NextAction::Execute,
            StepStatus::Paused => NextAction::Release,
            StepStatus::Failed if FlowStateMachine::can_retry(step, step_definition) => {
                match step.retry_at {
                    Some(at) if at > now => NextAction::Release,
                    _ => NextAction::Retry,
                }
            }
            StepStatus::Cancelled => NextAction::Done,
            StepStatus::Failed | StepStatus::Completed | StepStatus::Skipped => {
                match FlowStateMachine::next_step(instance, definition)? {
                    Some(next) => NextAction::Start(next),
                    None => NextAction::Done,
                }
            }
        };
        Ok(action)
    }

    async fn begin(
        &self,
        instance: &mut FlowInstance,
        definition: &FlowDefinition,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let step = Self::current_definition(instance, definition)?;

        let skip = match &step.skip_condition {
            Some(condition) => self.evaluator.evaluate(condition, &instance.context),
            None => Ok(false),
        };

        match skip {
            Ok(true) => {
                debug!(flow_instance_id = %instance.id, step_id = %step.id, "Step skipped");
                FlowStateMachine::transition_step(instance, step, StepStatus::Skipped, None, now)?;
            }
            Ok(false) => {
                let status = StepStatus::InProgress;
                FlowStateMachine::transition_step(instance, step, status, None, now)?;
            }
            Err(e) => {
                let status = StepStatus::InProgress;
                FlowStateMachine::transition_step(instance, step, status, None, now)?;
                FlowStateMachine::sync_flow_status(instance, definition, now)?;
                self.checkpoints.checkpoint(instance).await?;
                self.executor
                    .record_failure(instance, definition, step, e, now)?;
                return Ok(());
            }
        }

        FlowStateMachine::sync_flow_status(instance, definition, now)?;
        Ok(())
    }

    async fn execute(
        &self,
        instance: &mut FlowInstance,
        definition: &FlowDefinition,
        token: &CancellationToken,
    ) -> Result<(), CoreError> {
        let step = Self::current_definition(instance, definition)?;
        let record = instance.latest_step().ok_or_else(|| {
            CoreError::Other(format!("Flow instance {} has no step", instance.id))
        })?;

        let invocation = StepInvocation {
            flow_instance_id: instance.id.clone(),
            step_id: step.id.clone(),
            attempt: record.attempt_count,
            context: instance.context.clone(),
            resume: record.resume.clone(),
        };

        let outcome = self.executor.execute(step, invocation, token).await;
        self.executor
            .record_outcome(instance, definition, step, outcome, self.clock.now())?;
        Ok(())
    }

    fn current_definition<'a>(
        instance: &FlowInstance,
        definition: &'a FlowDefinition,
    ) -> Result<&'a StepDefinition, CoreError> {
        let step = instance.latest_step().ok_or_else(|| {
            CoreError::Other(format!("Flow instance {} has no step", instance.id))
        })?;
        definition.require_step(&step.step_id)
    }

    async fn load(&self, id: &FlowInstanceId) -> Result<FlowInstance, CoreError> {
        self.gateway
            .load_instance(id)
            .await?
            .ok_or_else(|| CoreError::FlowInstanceNotFound(id.0.clone()))
    }

    async fn definition_for(&self, instance: &FlowInstance) -> Result<FlowDefinition, CoreError> {
        self.definitions
            .find_version(&instance.flow_id, instance.flow_version)
            .await?
            .ok_or_else(|| {
                CoreError::FlowDefinitionNotFound(format!(
                    "{} v{}",
                    instance.flow_id, instance.flow_version
                ))
            })
    }
}

/// Turns external events into event resume requests
struct ExternalEventForwarder {
    gateway: Arc<dyn PersistenceGateway>,
    coordinator: Arc<ResumeCoordinator>,
}

#[async_trait]
impl EventHandler for ExternalEventForwarder {
    async fn handle(&self, topic: &str, message: BusMessage) -> Result<(), CoreError> {
        let BusMessage::External(event) = message else {
            debug!(topic, "Ignoring non-external message");
            return Ok(());
        };

        let targets: Vec<FlowInstanceId> = match &event.target {
            EventTarget::Instance(id) => vec![id.clone()],
            EventTarget::Correlation(correlation_id) => self
                .gateway
                .find_by_correlation(correlation_id)
                .await?
                .into_iter()
                .filter(|instance| !instance.is_terminal())
                .map(|instance| instance.id)
                .collect(),
        };

        for id in targets {
            let mut request =
                ResumeRequest::event(id.clone(), event.event_type.clone(), event.payload.clone());
            request.requested_by = event.requested_by.clone();

            match self.coordinator.resume(request).await {
                Ok(outcome) => debug!(
                    flow_instance_id = %id,
                    event_type = %event.event_type,
                    ?outcome,
                    "External event delivered"
                ),
                Err(
                    e @ (CoreError::TerminalStateViolation(_) | CoreError::ConcurrencyConflict(_)),
                ) => {
                    debug!(
                        flow_instance_id = %id,
                        event_type = %event.event_type,
                        error = %e,
                        "External event ignored"
                    )
                }
                Err(e) => warn!(
                    flow_instance_id = %id,
                    event_type = %event.event_type,
                    error = %e,
                    "External event delivery failed"
                ),
            }
        }
        Ok(())
    }
}

/// Builder for [`FlowOrchestrator`]
#[derive(Default)]
pub struct FlowOrchestratorBuilder {
    gateway: Option<Arc<dyn PersistenceGateway>>,
    definitions: Option<Arc<dyn FlowDefinitionRepository>>,
    handlers: Option<Arc<dyn HandlerRegistry>>,
    bus: Option<Arc<dyn EventBus>>,
    clock: Option<Arc<dyn Clock>>,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
    config: Option<EngineConfig>,
}

impl FlowOrchestratorBuilder {
    /// Persistence gateway for checkpoints (required)
    pub fn gateway(mut self, gateway: Arc<dyn PersistenceGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Flow definition repository (required)
    pub fn definitions(mut self, definitions: Arc<dyn FlowDefinitionRepository>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    /// Step handler registry (required)
    pub fn handlers(mut self, handlers: Arc<dyn HandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Event bus; defaults to an in-memory bus
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Clock; defaults to the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Condition evaluator; defaults to JMESPath
    pub fn evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Engine configuration; defaults to [`EngineConfig::default`]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Validate and assemble the orchestrator
    pub fn build(self) -> Result<FlowOrchestrator, CoreError> {
        let gateway = self.gateway.ok_or_else(|| {
            CoreError::ValidationError("A persistence gateway is required".to_string())
        })?;
        let definitions = self.definitions.ok_or_else(|| {
            CoreError::ValidationError("A flow definition repository is required".to_string())
        })?;
        let handlers = self.handlers.ok_or_else(|| {
            CoreError::ValidationError("A handler registry is required".to_string())
        })?;

        let config = self.config.unwrap_or_default();
        config.validate()?;

        let bus: Arc<dyn EventBus> = self
            .bus
            .unwrap_or_else(|| Arc::new(InMemoryEventBus::new()));
        bus.register_topic(FLOW_EVENTS_TOPIC);
        bus.register_topic(ENTITY_EVENTS_TOPIC);

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let evaluator: Arc<dyn ConditionEvaluator> = self
            .evaluator
            .unwrap_or_else(|| Arc::new(JmesPathConditionEvaluator));

        let executor = Arc::new(StepExecutor::new(
            handlers.clone(),
            config.grace_period(),
            config.retry.clone(),
        ));
        let checkpoints = Arc::new(CheckpointWriter::new(
            gateway.clone(),
            bus.clone(),
            clock.clone(),
            config.persistence_retry.clone(),
        ));
        let scheduler = Arc::new(TimeoutScheduler::new());
        let queue = Arc::new(WorkQueue::new());
        let locks = Arc::new(InstanceLocks::new());

        let coordinator = Arc::new(ResumeCoordinator::new(
            gateway.clone(),
            definitions.clone(),
            evaluator.clone(),
            executor.clone(),
            checkpoints.clone(),
            scheduler.clone(),
            queue.clone(),
            locks.clone(),
            clock.clone(),
            config.lock_wait(),
        ));

        Ok(FlowOrchestrator {
            gateway,
            definitions,
            handlers,
            bus,
            clock,
            evaluator,
            config,
            executor,
            coordinator,
            checkpoints,
            scheduler,
            queue,
            locks,
            running: DashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::handler::StaticHandlerRegistry;
    use crate::domain::repository::memory::{
        MemoryFlowDefinitionRepository, MemoryPersistenceGateway,
    };

    #[test]
    fn test_builder_requires_collaborators() {
        let missing_gateway = FlowOrchestrator::builder()
            .definitions(Arc::new(MemoryFlowDefinitionRepository::default()))
            .handlers(Arc::new(StaticHandlerRegistry::new()))
            .build();
        assert!(matches!(missing_gateway, Err(CoreError::ValidationError(_))));

        let missing_handlers = FlowOrchestrator::builder()
            .gateway(Arc::new(MemoryPersistenceGateway::default()))
            .definitions(Arc::new(MemoryFlowDefinitionRepository::default()))
            .build();
        assert!(matches!(missing_handlers, Err(CoreError::ValidationError(_))));

        let invalid_config = FlowOrchestrator::builder()
            .gateway(Arc::new(MemoryPersistenceGateway::default()))
            .definitions(Arc::new(MemoryFlowDefinitionRepository::default()))
            .handlers(Arc::new(StaticHandlerRegistry::new()))
            .config(EngineConfig {
                worker_count: 0,
                ..EngineConfig::default()
            })
            .build();
        assert!(matches!(invalid_config, Err(CoreError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_builder_registers_topics() {
        let bus = Arc::new(InMemoryEventBus::new());
        let orchestrator = FlowOrchestrator::builder()
            .gateway(Arc::new(MemoryPersistenceGateway::default()))
            .definitions(Arc::new(MemoryFlowDefinitionRepository::default()))
            .handlers(Arc::new(StaticHandlerRegistry::new()))
            .event_bus(bus.clone())
            .build()
            .unwrap();

        assert!(bus.has_topic(FLOW_EVENTS_TOPIC));
        assert!(bus.has_topic(ENTITY_EVENTS_TOPIC));
        assert_eq!(orchestrator.config().worker_count, 4);

        orchestrator.subscribe_external_events("kyc.approved").unwrap();
        assert!(bus.has_topic("kyc.approved"));
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let orchestrator = FlowOrchestrator::builder()
            .gateway(Arc::new(MemoryPersistenceGateway::default()))
            .definitions(Arc::new(MemoryFlowDefinitionRepository::default()))
            .handlers(Arc::new(StaticHandlerRegistry::new()))
            .build()
            .unwrap();

        let id = FlowInstanceId::from("missing");
        assert!(matches!(
            orchestrator.get_status(&id).await,
            Err(CoreError::FlowInstanceNotFound(_))
        ));
        assert!(matches!(
            orchestrator.cancel_flow(&id).await,
            Err(CoreError::FlowInstanceNotFound(_))
        ));
        assert_eq!(orchestrator.run_pending().await, 0);
    }
}
