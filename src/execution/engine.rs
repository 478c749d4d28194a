//! Workflow Execution Engine
//!
//! The engine that drives workflow executions:
//! - Every state entry and every resumption is a short task on the tokio
//!   runtime; nothing blocks while a state waits
//! - Waiting states (async steps, barriers, queued permits, delays) only
//!   leave a record in the notify registry
//! - Completed waits come back through one work channel
//! - Every record change is written through the state store
//! - A settled execution is dropped from memory after a retention period
//!
//! Transitions and failure handling live in `transition`, interrupts
//! (abort, expire, pause, resume) in `interrupt`, restart recovery in
//! `recovery`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::step::{ShellCommandExecutor, StepExecutor, StepOutcome, StepRequest, StepResponse};
use crate::config::EngineConfig;
use crate::context::{
    ContextElement, ContextElementKind, ContextStack, ElementResolver, ExecutionContext, PassthroughResolver,
};
use crate::error::{EngineError, Result};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::queue::{EventQueue, InventoryReconciler, WorkerPool};
use crate::sync::{
    barrier, constraint, AcquireOutcome, ArrivalOutcome, BarrierRegistry, ConstraintConfig, Grant, NotifyOutcome,
    NotifyRegistry, NotifyResponseData, Rejection, Requester, ResourceConstraintRegistry, Resumption,
};
use crate::workflow::model::{ExecutionMode, HoldingScope, MachinePath, State, StateMachine, StateType, StepSpec};
use crate::workflow::state::{store_for, StateStore, StoredElement};
use crate::workflow::status::{ExecutionStatus, FailureType};
use crate::workflow::step_data::{StepExecutionData, StepExecutionSummary, StepKind};
use crate::workflow::validator::{validate_definition, BarrierPlan};
use crate::workflow::{StateExecutionInstance, WorkflowDefinition, WorkflowExecution};

/// Unit of work handed to the dispatcher.
pub(super) enum Work {
    Start(String),
    Resume(Resumption),
    /// Drop a settled execution from memory
    Evict(String),
}

/// Correlation id an approval state waits on.
pub fn approval_id(instance_id: &str) -> String {
    format!("approval:{}", instance_id)
}

/// Builds an [`Engine`].
///
/// `COMMAND` steps run through [`ShellCommandExecutor`] unless another
/// executor is registered for them.
pub struct EngineBuilder {
    config: EngineConfig,
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
    resolver: Option<Arc<dyn ElementResolver>>,
    store: Option<Arc<dyn StateStore>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            executors: HashMap::new(),
            resolver: None,
            store: None,
        }
    }

    pub fn with_executor(mut self, kind: StepKind, executor: Arc<dyn StepExecutor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ElementResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Creates the engine and its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(mut self) -> Engine {
        let (work_tx, work_rx) = mpsc::unbounded_channel();

        let sink = work_tx.clone();
        let registry = Arc::new(NotifyRegistry::new(move |resumption| {
            if sink.send(Work::Resume(resumption)).is_err() {
                warn!("Engine stopped; dropping resumption");
            }
        }));

        let constraints = ResourceConstraintRegistry::new();
        for config in &self.config.resource_constraints {
            if let Err(e) = constraints.register(config) {
                error!("Ignoring resource constraint '{}': {}", config.name, e);
            }
        }

        self.executors
            .entry(StepKind::Command)
            .or_insert_with(|| Arc::new(ShellCommandExecutor::new()));

        let store = self
            .store
            .unwrap_or_else(|| Arc::from(store_for(self.config.state_dir.as_deref())));
        let events = Arc::new(EventQueue::new(&self.config.queue));

        let inner = Arc::new(EngineInner {
            config: self.config,
            definitions: DashMap::new(),
            plans: DashMap::new(),
            executions: DashMap::new(),
            instances: DashMap::new(),
            elements: DashMap::new(),
            registry,
            barriers: BarrierRegistry::new(),
            constraints,
            events,
            executors: self.executors,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(PassthroughResolver)),
            store,
            timelines: DashMap::new(),
            completions: DashMap::new(),
            work: work_tx,
        });
        spawn_dispatcher(Arc::downgrade(&inner), work_rx);

        Engine { inner }
    }
}

fn spawn_dispatcher(inner: Weak<EngineInner>, mut work: mpsc::UnboundedReceiver<Work>) {
    tokio::spawn(async move {
        while let Some(item) = work.recv().await {
            let Some(engine) = inner.upgrade() else {
                break;
            };
            tokio::spawn(async move { engine.process(item).await });
        }
        debug!("Engine dispatcher stopped");
    });
}

/// Shared engine state.
pub(super) struct EngineInner {
    pub(super) config: EngineConfig,
    pub(super) definitions: DashMap<String, Arc<WorkflowDefinition>>,
    pub(super) plans: DashMap<String, BarrierPlan>,
    pub(super) executions: DashMap<String, WorkflowExecution>,
    pub(super) instances: DashMap<String, StateExecutionInstance>,
    /// element id -> (owning instance id, element)
    pub(super) elements: DashMap<String, (String, ContextElement)>,
    pub(super) registry: Arc<NotifyRegistry>,
    pub(super) barriers: BarrierRegistry,
    pub(super) constraints: ResourceConstraintRegistry,
    pub(super) events: Arc<EventQueue>,
    pub(super) executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
    pub(super) resolver: Arc<dyn ElementResolver>,
    pub(super) store: Arc<dyn StateStore>,
    pub(super) timelines: DashMap<String, ExecutionTimeline>,
    pub(super) completions: DashMap<String, watch::Sender<Option<ExecutionStatus>>>,
    work: mpsc::UnboundedSender<Work>,
}

/// Workflow execution engine.
///
/// Cheap to clone; clones share the same executions.
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::BTreeMap;
/// use deployflow::config::EngineConfig;
/// use deployflow::execution::EngineBuilder;
/// use deployflow::load_workflow;
///
/// # async fn run() -> deployflow::Result<()> {
/// let workflow = load_workflow("deploy.yaml")?;
/// let engine = EngineBuilder::new(EngineConfig::default()).build();
///
/// let execution_id = engine.start(workflow, BTreeMap::new()).await?;
/// let status = engine.wait_for_completion(&execution_id).await?;
/// println!("{} finished: {}", execution_id, status);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Validates `definition` and starts a new execution of it.
    ///
    /// `inputs` override workflow variables of the same name. Returns the
    /// execution id.
    pub async fn start(&self, definition: WorkflowDefinition, inputs: BTreeMap<String, Value>) -> Result<String> {
        self.inner.start(definition, inputs).await
    }

    /// Waits until an execution reaches a terminal status.
    ///
    /// An execution already dropped from memory is looked up in the store.
    pub async fn wait_for_completion(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let subscribed = self.inner.completions.get(execution_id).map(|tx| tx.subscribe());
        let Some(mut rx) = subscribed else {
            return match self.inner.store.load_execution(execution_id).await? {
                Some(execution) if execution.status.is_terminal() => Ok(execution.status),
                _ => Err(EngineError::UnknownExecution(execution_id.to_string())),
            };
        };
        let status = *rx
            .wait_for(|status| status.is_some())
            .await
            .map_err(|_| EngineError::UnknownExecution(execution_id.to_string()))?;
        status.ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))
    }

    /// Delivers an external response for a correlation id.
    pub fn notify(&self, correlation_id: &str, data: NotifyResponseData) -> NotifyOutcome {
        self.inner.registry.notify(correlation_id, data)
    }

    /// Approves the approval state running as `instance_id`.
    pub fn approve(&self, instance_id: &str, approver: &str) -> NotifyOutcome {
        self.notify(&approval_id(instance_id), NotifyResponseData::approve(approver))
    }

    /// Rejects the approval state running as `instance_id`.
    pub fn reject(&self, instance_id: &str, approver: &str, comments: &str) -> NotifyOutcome {
        self.notify(&approval_id(instance_id), NotifyResponseData::reject(approver, comments))
    }

    /// Reloads unfinished executions from the store and resumes them.
    ///
    /// Returns the number of executions recovered.
    pub async fn recover(&self) -> Result<usize> {
        self.inner.recover().await
    }

    /// Aborts an execution: every unfinished state ends ABORTED.
    pub async fn abort(&self, execution_id: &str) -> Result<()> {
        self.inner
            .abort_execution(execution_id, ExecutionStatus::Aborted, "aborted by request".to_string())
            .await
    }

    /// Expires an execution: every unfinished state ends EXPIRED.
    pub async fn expire(&self, execution_id: &str) -> Result<()> {
        self.inner
            .abort_execution(execution_id, ExecutionStatus::Expired, "execution expired".to_string())
            .await
    }

    /// Holds back new state entries until [`Engine::resume`].
    pub async fn pause(&self, execution_id: &str) -> Result<()> {
        self.inner.pause_execution(execution_id).await
    }

    pub async fn resume(&self, execution_id: &str) -> Result<()> {
        self.inner.resume_execution(execution_id).await
    }

    pub fn execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.inner.executions.get(execution_id).map(|e| e.clone())
    }

    pub fn instance(&self, instance_id: &str) -> Option<StateExecutionInstance> {
        self.inner.instances.get(instance_id).map(|i| i.clone())
    }

    /// Every instance of an execution, oldest first.
    pub fn instances(&self, execution_id: &str) -> Vec<StateExecutionInstance> {
        self.inner.instances_of(execution_id)
    }

    /// Instances of one state, oldest first (retries and rollbacks add more).
    pub fn find_instances(&self, execution_id: &str, state_name: &str) -> Vec<StateExecutionInstance> {
        self.inner
            .instances_of(execution_id)
            .into_iter()
            .filter(|i| i.state_name == state_name)
            .collect()
    }

    /// Resolves a name against the context an instance sees.
    pub fn resolve(&self, instance_id: &str, name: &str) -> Result<Value> {
        let instance = self.inner.instance(instance_id)?;
        self.inner.context_for(&instance).resolve(name)
    }

    pub async fn summaries(&self, execution_id: &str) -> Result<Vec<StepExecutionSummary>> {
        self.inner.store.summaries_for_execution(execution_id).await
    }

    pub fn timeline(&self, execution_id: &str) -> Option<ExecutionTimeline> {
        self.inner.timelines.get(execution_id).map(|t| t.clone())
    }

    /// Registers (or resizes) a resource constraint.
    ///
    /// Queued requests that no longer fit fail their waiting states.
    pub async fn register_constraint(&self, config: &ConstraintConfig) -> Result<()> {
        let registration = self.inner.constraints.register(config)?;
        self.inner.save_constraint(&config.name).await;
        self.inner.deliver_rejections(registration.rejected);
        self.inner.deliver_grants(registration.grants).await;
        Ok(())
    }

    /// Releases a permit ahead of the holder's own completion.
    pub async fn release_constraint(&self, resource: &str, holder_id: &str) -> Result<()> {
        let grants = self.inner.constraints.release(resource, holder_id)?;
        for mut instance in self.inner.instances.iter_mut() {
            if instance.id == holder_id || (instance.is_root() && instance.execution_id == holder_id) {
                instance.held_permits.retain(|r| r != resource);
            }
        }
        self.inner.save_constraint(resource).await;
        self.inner.deliver_grants(grants).await;
        Ok(())
    }

    pub fn event_queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.inner.events)
    }

    /// Starts reconciliation workers on the engine's event queue, sized
    /// by the queue configuration.
    pub fn spawn_workers(&self, reconciler: Arc<dyn InventoryReconciler>) -> WorkerPool {
        let queue = &self.inner.config.queue;
        WorkerPool::spawn(
            Arc::clone(&self.inner.events),
            reconciler,
            Arc::clone(&self.inner.store),
            queue.workers,
            queue.poll_interval(),
        )
    }

    pub fn constraints(&self) -> &ResourceConstraintRegistry {
        &self.inner.constraints
    }

    pub fn barriers(&self) -> &BarrierRegistry {
        &self.inner.barriers
    }

    pub fn registry(&self) -> &Arc<NotifyRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl EngineInner {
    async fn start(&self, definition: WorkflowDefinition, inputs: BTreeMap<String, Value>) -> Result<String> {
        let plan = validate_definition(&definition)?;
        self.check_admission(&definition)?;

        let execution_id = Uuid::new_v4().to_string();
        for (key, participants) in &plan {
            self.barriers.define(&execution_id, key, participants.clone())?;
        }

        let mut root = StateExecutionInstance::root(&execution_id, &definition.name);
        let mut element = ContextElement::new(ContextElementKind::Standard, definition.name.clone());
        for (key, value) in definition.variables.iter().chain(inputs.iter()) {
            element = element.with_value(key.clone(), value.clone());
        }
        let element_id = self.store_element(&execution_id, &root.id, element).await;
        root.context_stack.push(element_id.clone());
        root.context_element_ids.push(element_id);

        let mut execution = WorkflowExecution::new(&definition.name, &root.id, &execution_id);
        execution.status = ExecutionStatus::Running;

        info!(
            "Starting execution {} of workflow '{}' ({} states)",
            execution_id,
            definition.name,
            definition.state_count()
        );

        if let Err(e) = self.store.save_definition(&execution_id, &definition).await {
            error!("Failed to persist the definition of {}: {}", execution_id, e);
        }
        let root_id = root.id.clone();
        self.definitions.insert(execution_id.clone(), Arc::new(definition));
        self.plans.insert(execution_id.clone(), plan);
        self.timelines
            .insert(execution_id.clone(), ExecutionTimeline::new(execution_id.clone()));
        self.completions
            .insert(execution_id.clone(), watch::channel(None).0);
        self.instances.insert(root_id.clone(), root);
        self.executions.insert(execution_id.clone(), execution);

        self.persist_execution(&execution_id).await;
        self.persist_instance(&root_id).await;
        self.dispatch(&root_id);
        Ok(execution_id)
    }

    /// Rejects constraint usages that can never be granted.
    fn check_admission(&self, definition: &WorkflowDefinition) -> Result<()> {
        for state in definition.machine.all_states() {
            let Some(usage) = &state.constraint else {
                continue;
            };
            if let Some(capacity) = self.constraints.capacity(&usage.resource) {
                if usage.units > capacity {
                    return Err(EngineError::Admission {
                        resource: usage.resource.clone(),
                        message: format!(
                            "state '{}' requests {} units but capacity is {}",
                            state.name, usage.units, capacity
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    async fn process(self: Arc<Self>, work: Work) {
        let (instance_id, result) = match work {
            Work::Evict(execution_id) => {
                self.evict(&execution_id);
                return;
            }
            Work::Start(id) => {
                let result = self.start_instance(&id).await;
                (id, result)
            }
            Work::Resume(resumption) => {
                let id = resumption.instance_id.clone();
                (id, self.resume_instance(resumption).await)
            }
        };

        if let Err(e) = result {
            if !self.instances.contains_key(&instance_id) {
                debug!("Instance {} is no longer tracked: {}", instance_id, e);
                return;
            }
            error!("State instance {} failed inside the engine: {}", instance_id, e);
            let outcome = self
                .complete_state(
                    &instance_id,
                    ExecutionStatus::Error,
                    Some(e.to_string()),
                    vec![FailureType::Application],
                )
                .await;
            if let Err(e) = outcome {
                error!("Could not record the error of {}: {}", instance_id, e);
            }
        }
    }

    async fn start_instance(self: &Arc<Self>, id: &str) -> Result<()> {
        let instance = self.instance(id)?;
        if !matches!(
            instance.status,
            ExecutionStatus::New | ExecutionStatus::Queued | ExecutionStatus::Resumed
        ) {
            debug!("Instance {} is {}; ignoring start", id, instance.status);
            return Ok(());
        }
        if !self.is_live(&instance.execution_id) {
            return Ok(());
        }

        let paused = self
            .executions
            .get(&instance.execution_id)
            .map(|e| e.paused)
            .unwrap_or(false);
        if paused {
            if self.update_instance(id, |i| i.advance(ExecutionStatus::Paused))? {
                info!(
                    "State '{}' held back: execution {} is paused",
                    instance.state_name, instance.execution_id
                );
                self.record(&instance, EventType::Paused);
                self.persist_instance(id).await;
            }
            return Ok(());
        }

        let definition = self.definition(&instance.execution_id)?;
        if !instance.is_root() {
            let state = self.state_of(&definition, &instance)?;
            if state.wait_interval_secs > 0 && !instance.delay_elapsed {
                return self.delay_start(&instance, state.wait_interval_secs).await;
            }
        }
        self.enter_state(id, &definition).await
    }

    /// Parks an instance until its wait interval elapsed.
    async fn delay_start(&self, instance: &StateExecutionInstance, secs: u64) -> Result<()> {
        let correlation_id = format!("delay:{}", instance.id);
        self.registry.register_wait(&instance.id, vec![correlation_id.clone()])?;
        if !self.set_waiting(&instance.id, vec![correlation_id.clone()])? {
            return Ok(());
        }
        self.registry.schedule_notify(
            correlation_id,
            NotifyResponseData::DelayElapsed,
            Duration::from_secs(secs),
        );
        debug!("State '{}' starts in {}s", instance.state_name, secs);
        self.record(instance, EventType::Waiting);
        self.persist_instance(&instance.id).await;
        Ok(())
    }

    /// Moves an instance to RUNNING and runs its state type's behavior.
    pub(super) async fn enter_state(self: &Arc<Self>, id: &str, definition: &WorkflowDefinition) -> Result<()> {
        let Some(instance) = self.update_instance(id, |i| i.advance(ExecutionStatus::Running).then(|| i.clone()))? else {
            return Ok(());
        };
        self.record(&instance, EventType::Started);

        if instance.is_root() {
            self.persist_instance(id).await;
            return self
                .fan_out(&instance, &definition.machine, ExecutionMode::Forward)
                .await;
        }

        let state = self.state_of(definition, &instance)?;
        info!("Entering state '{}' ({:?})", state.name, state.state_type);

        if instance.rollback && self.rolled_back_before(&instance) {
            info!("Rollback step '{}' already succeeded; skipping", instance.state_name);
            return self
                .complete_state(id, ExecutionStatus::Skipped, None, Vec::new())
                .await;
        }

        let instance = self.push_state_context(&instance, state).await?;
        self.persist_instance(id).await;

        match state.state_type {
            StateType::Phase | StateType::PhaseStep | StateType::SubWorkflow => {
                let machine = self.child_machine(state, ExecutionMode::Forward)?;
                self.fan_out(&instance, machine, ExecutionMode::Forward).await
            }
            StateType::Step => self.run_step(instance, state).await,
            StateType::Barrier => self.arrive_at_barrier(instance, state).await,
            StateType::ResourceConstraint => self.acquire_permit(instance, state).await,
            StateType::Wait => self.start_wait(instance, state).await,
            StateType::Approval => self.start_approval(instance, state).await,
            StateType::Workflow => Err(EngineError::UnknownState {
                machine: instance.machine_path.to_string(),
                state: state.name.clone(),
            }),
        }
    }

    /// Whether a rollback state already succeeded in an earlier run of
    /// the same rollback machine.
    fn rolled_back_before(&self, instance: &StateExecutionInstance) -> bool {
        self.instances.iter().any(|other| {
            other.id != instance.id
                && other.execution_id == instance.execution_id
                && other.machine_path == instance.machine_path
                && other.state_name == instance.state_name
                && other.status == ExecutionStatus::Success
        })
    }

    async fn push_state_context(
        &self,
        instance: &StateExecutionInstance,
        state: &State,
    ) -> Result<StateExecutionInstance> {
        let (execution_id, id) = (instance.execution_id.as_str(), instance.id.as_str());
        let mut pushed = Vec::new();
        if state.state_type == StateType::Phase {
            let phase = ContextElement::new(ContextElementKind::Phase, state.name.clone());
            pushed.push(self.store_element(execution_id, id, phase).await);
        }
        for element in &state.context {
            pushed.push(self.store_element(execution_id, id, element.instantiate()).await);
        }
        self.update_instance(id, |i| {
            i.context_stack.extend(pushed.iter().cloned());
            i.context_element_ids.extend(pushed);
            i.clone()
        })
    }

    /// Starts the initial states of `machine` as children of `parent` and
    /// parks the parent until every child branch ended.
    pub(super) async fn fan_out(
        self: &Arc<Self>,
        parent: &StateExecutionInstance,
        machine: &StateMachine,
        mode: ExecutionMode,
    ) -> Result<()> {
        let path = if parent.is_root() {
            MachinePath::root()
        } else {
            parent.machine_path.child(&parent.state_name, mode)
        };
        let rollback = parent.rollback || mode == ExecutionMode::Rollback;

        let children: Vec<StateExecutionInstance> = machine
            .initial_states()
            .into_iter()
            .map(|state| {
                let mut child = StateExecutionInstance::new(&parent.execution_id, state, path.clone());
                child.parent_instance_id = Some(parent.id.clone());
                child.notify_id = Some(format!("child:{}", child.id));
                child.branch = if parent.is_root() {
                    Some(state.name.clone())
                } else {
                    parent.branch.clone()
                };
                child.rollback = rollback;
                child.context_stack = parent.context_stack.clone();
                child
            })
            .collect();

        if children.is_empty() {
            return self
                .complete_state(&parent.id, ExecutionStatus::Success, None, Vec::new())
                .await;
        }

        let notify_ids: Vec<String> = children.iter().filter_map(|c| c.notify_id.clone()).collect();
        let child_ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
        for child in children {
            self.instances.insert(child.id.clone(), child);
        }

        self.registry.register_wait(&parent.id, notify_ids.clone())?;
        self.update_instance(&parent.id, |p| p.child_instance_ids.extend(child_ids.iter().cloned()))?;
        if !self.set_waiting(&parent.id, notify_ids)? {
            return Ok(());
        }
        debug!(
            "'{}' fanned out {} branch(es) in {}",
            parent.state_name,
            child_ids.len(),
            path
        );
        self.record(parent, EventType::Waiting);
        self.persist_instance(&parent.id).await;

        for id in &child_ids {
            self.persist_instance(id).await;
            self.dispatch(id);
        }
        Ok(())
    }

    async fn run_step(self: &Arc<Self>, instance: StateExecutionInstance, state: &State) -> Result<()> {
        let spec = self.step_spec(state)?;
        let request = match self.step_request(&instance, spec) {
            Ok(request) => request,
            Err(e @ EngineError::Resolution(_)) => return self.fail_unresolved(&instance, e).await,
            Err(e) => return Err(e),
        };

        let Some(executor) = self.executors.get(&spec.kind).cloned() else {
            return self
                .complete_state(
                    &instance.id,
                    ExecutionStatus::Error,
                    Some(EngineError::NoExecutor(spec.kind).to_string()),
                    vec![FailureType::Application],
                )
                .await;
        };

        debug!("Executing {} step '{}'", spec.kind, instance.state_name);
        match executor.execute(&request).await {
            Ok(StepResponse::Completed(outcome)) => self.apply_outcome(&instance, outcome).await,
            Ok(StepResponse::Async {
                correlation_ids,
                data,
                timeout,
            }) => {
                let timeout = timeout
                    .or_else(|| state.timeout_secs.map(Duration::from_secs))
                    .unwrap_or_else(|| self.config.default_step_timeout());
                self.await_step(&instance, correlation_ids, data, timeout).await
            }
            Err(e) => {
                warn!("Step '{}' executor failed: {}", instance.state_name, e);
                self.complete_state(
                    &instance.id,
                    ExecutionStatus::Error,
                    Some(e.to_string()),
                    vec![FailureType::Application],
                )
                .await
            }
        }
    }

    async fn await_step(
        &self,
        instance: &StateExecutionInstance,
        correlation_ids: Vec<String>,
        data: Option<StepExecutionData>,
        timeout: Duration,
    ) -> Result<()> {
        let wait_id = self.registry.register_wait(&instance.id, correlation_ids.clone())?;
        if data.is_some() {
            self.update_instance(&instance.id, |i| i.step_data = data)?;
        }
        if !self.set_waiting(&instance.id, correlation_ids.clone())? {
            return Ok(());
        }
        self.registry.schedule_timeout(wait_id, timeout);

        info!(
            "Step '{}' waiting on {} (timeout {:?})",
            instance.state_name,
            correlation_ids.join(", "),
            timeout
        );
        self.record(instance, EventType::Waiting);
        self.persist_instance(&instance.id).await;
        Ok(())
    }

    /// Records a step's result and completes its instance.
    async fn apply_outcome(self: &Arc<Self>, instance: &StateExecutionInstance, outcome: StepOutcome) -> Result<()> {
        let StepOutcome {
            mut status,
            mut error_message,
            failure_types,
            data,
            context_elements,
            events,
        } = outcome;

        if !status.is_terminal() {
            warn!(
                "Step '{}' returned non-terminal status {}",
                instance.state_name, status
            );
            error_message = Some(format!("executor returned non-terminal status {}", status));
            status = ExecutionStatus::Error;
        }

        let mut produced = Vec::with_capacity(context_elements.len());
        for element in context_elements {
            produced.push(
                self.store_element(&instance.execution_id, &instance.id, element.instantiate())
                    .await,
            );
        }
        self.update_instance(&instance.id, |i| {
            if data.is_some() {
                i.step_data = data;
            }
            i.produced_element_ids.extend(produced);
        })?;

        for event in events {
            let event = if event.state_instance_id.is_none() {
                event.with_instance(instance.id.clone())
            } else {
                event
            };
            let event_id = self.events.enqueue(event);
            debug!("Step '{}' enqueued event {}", instance.state_name, event_id);
        }
        self.events.persist_changes(self.store.as_ref()).await;

        self.complete_state(&instance.id, status, error_message, failure_types)
            .await
    }

    async fn arrive_at_barrier(self: &Arc<Self>, instance: StateExecutionInstance, state: &State) -> Result<()> {
        let key = state
            .barrier
            .as_ref()
            .map(|b| b.key.clone())
            .ok_or_else(|| self.missing(&instance, "barrier key"))?;
        let participant = instance
            .branch
            .clone()
            .unwrap_or_else(|| instance.state_name.clone());
        let execution_id = instance.execution_id.clone();

        // Registered before arriving so a release racing with us is not lost.
        let correlation_id = barrier::correlation_id(&execution_id, &key, &participant);
        self.registry.register_wait(&instance.id, vec![correlation_id.clone()])?;
        self.update_instance(&instance.id, |i| {
            i.step_data = Some(StepExecutionData::Barrier {
                key: key.clone(),
                participant: participant.clone(),
                arrivals: BTreeMap::new(),
            });
        })?;

        let arrival = self
            .barriers
            .arrive(&execution_id, &key, &participant, ExecutionStatus::Success);
        self.save_barrier(&execution_id, &key).await;

        match arrival {
            Ok(ArrivalOutcome::Waiting { .. }) => {
                if self.set_waiting(&instance.id, vec![correlation_id])? {
                    info!("'{}' waiting at barrier '{}'", participant, key);
                    self.record(&instance, EventType::Waiting);
                    self.persist_instance(&instance.id).await;
                }
                Ok(())
            }
            Ok(ArrivalOutcome::Released { arrivals, waiters }) => {
                self.registry.cancel_instance(&instance.id);
                self.update_instance(&instance.id, |i| {
                    if let Some(StepExecutionData::Barrier { arrivals: recorded, .. }) = &mut i.step_data {
                        *recorded = arrivals;
                    }
                })?;
                self.wake_barrier_waiters(&key, waiters, ExecutionStatus::Success);
                self.complete_state(&instance.id, ExecutionStatus::Success, None, Vec::new())
                    .await
            }
            Err(e) => {
                self.registry.cancel_instance(&instance.id);
                let status = match &e {
                    EngineError::BarrierReleased(_) => ExecutionStatus::Aborted,
                    _ => ExecutionStatus::Failed,
                };
                self.complete_state(&instance.id, status, Some(e.to_string()), vec![FailureType::Application])
                    .await
            }
        }
    }

    async fn acquire_permit(self: &Arc<Self>, instance: StateExecutionInstance, state: &State) -> Result<()> {
        let usage = state
            .constraint
            .as_ref()
            .ok_or_else(|| self.missing(&instance, "constraint usage"))?;
        let (holder_id, _) = self.permit_holder(&instance, usage.scope)?;
        let requester = Requester::new(holder_id.clone(), instance.execution_id.clone());

        // Every instance waits on its own id; grants to the holder fan out
        // to all of them. Registered before acquiring so a grant racing
        // with us is not lost.
        let waiter_id = constraint::waiter_id(&usage.resource, &holder_id, &instance.id);
        self.registry.register_wait(&instance.id, vec![waiter_id.clone()])?;
        self.update_instance(&instance.id, |i| {
            i.step_data = Some(StepExecutionData::ResourceConstraint {
                resource: usage.resource.clone(),
                holder: holder_id.clone(),
                units: usage.units,
                queued: false,
            });
        })?;

        let acquired = self
            .constraints
            .acquire(&usage.resource, &requester, usage.units, usage.priority);
        self.save_constraint(&usage.resource).await;

        match acquired {
            Ok(AcquireOutcome::Granted) => {
                self.registry.cancel_instance(&instance.id);
                info!("'{}' acquired {} unit(s) of '{}'", holder_id, usage.units, usage.resource);
                self.hold_permit(&instance, usage.scope, &usage.resource)?;
                self.complete_state(&instance.id, ExecutionStatus::Success, None, Vec::new())
                    .await
            }
            Ok(AcquireOutcome::Queued { .. }) => {
                self.update_instance(&instance.id, |i| {
                    if let Some(StepExecutionData::ResourceConstraint { queued, .. }) = &mut i.step_data {
                        *queued = true;
                    }
                })?;
                // A grant may already have resumed and completed the instance.
                if self.set_waiting(&instance.id, vec![waiter_id])? {
                    info!("'{}' queued for '{}'", holder_id, usage.resource);
                    self.record(&instance, EventType::Waiting);
                    self.persist_instance(&instance.id).await;
                }
                Ok(())
            }
            Err(e) => {
                self.registry.cancel_instance(&instance.id);
                warn!("'{}' cannot acquire '{}': {}", holder_id, usage.resource, e);
                self.complete_state(
                    &instance.id,
                    ExecutionStatus::Failed,
                    Some(e.to_string()),
                    vec![FailureType::Admission],
                )
                .await
            }
        }
    }

    /// Holder id for a permit and the instance that releases it on
    /// completion.
    fn permit_holder(&self, instance: &StateExecutionInstance, scope: HoldingScope) -> Result<(String, String)> {
        let phase = match scope {
            HoldingScope::Phase => self
                .ancestors(instance)
                .into_iter()
                .find(|a| a.state_type == StateType::Phase),
            HoldingScope::Workflow => None,
        };
        match phase {
            Some(phase) => Ok((phase.id.clone(), phase.id)),
            None => {
                let root = self.execution_record(&instance.execution_id)?.root_instance_id;
                Ok((instance.execution_id.clone(), root))
            }
        }
    }

    fn hold_permit(&self, instance: &StateExecutionInstance, scope: HoldingScope, resource: &str) -> Result<()> {
        let (_, scope_instance) = self.permit_holder(instance, scope)?;
        self.update_instance(&scope_instance, |holder| {
            if !holder.held_permits.iter().any(|r| r == resource) {
                holder.held_permits.push(resource.to_string());
            }
        })
    }

    async fn start_wait(&self, instance: StateExecutionInstance, state: &State) -> Result<()> {
        let secs = state.wait_secs.unwrap_or(0);
        let correlation_id = format!("wait:{}", instance.id);
        self.registry.register_wait(&instance.id, vec![correlation_id.clone()])?;
        self.update_instance(&instance.id, |i| {
            i.step_data = Some(StepExecutionData::Wait { duration_secs: secs });
        })?;
        if !self.set_waiting(&instance.id, vec![correlation_id.clone()])? {
            return Ok(());
        }
        self.registry.schedule_notify(
            correlation_id,
            NotifyResponseData::DelayElapsed,
            Duration::from_secs(secs),
        );
        info!("'{}' waiting {}s", instance.state_name, secs);
        self.record(&instance, EventType::Waiting);
        self.persist_instance(&instance.id).await;
        Ok(())
    }

    async fn start_approval(&self, instance: StateExecutionInstance, state: &State) -> Result<()> {
        let approval_id = approval_id(&instance.id);
        let timeout = state
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.default_step_timeout());
        let wait_id = self.registry.register_wait(&instance.id, vec![approval_id.clone()])?;
        self.update_instance(&instance.id, |i| {
            i.step_data = Some(StepExecutionData::Approval {
                approval_id: approval_id.clone(),
                approved: None,
                approver: None,
                comments: None,
            });
        })?;
        if !self.set_waiting(&instance.id, vec![approval_id.clone()])? {
            return Ok(());
        }
        self.registry.schedule_timeout(wait_id, timeout);
        info!(
            "'{}' waiting for approval on {} (timeout {:?})",
            instance.state_name, approval_id, timeout
        );
        self.record(&instance, EventType::Waiting);
        self.persist_instance(&instance.id).await;
        Ok(())
    }

    async fn finish_approval(self: &Arc<Self>, instance: StateExecutionInstance, resumption: Resumption) -> Result<()> {
        if resumption.timed_out {
            return self
                .complete_state(
                    &instance.id,
                    ExecutionStatus::Expired,
                    Some("no approval decision before the timeout".to_string()),
                    vec![FailureType::Timeout],
                )
                .await;
        }

        let decision = resumption.responses.values().find_map(|response| match response {
            NotifyResponseData::Approval {
                approved,
                approver,
                comments,
            } => Some((*approved, approver.clone(), comments.clone())),
            _ => None,
        });
        let Some((approved, approver, comments)) = decision else {
            let status = resumption
                .responses
                .values()
                .filter_map(|r| r.status())
                .find(|s| !s.is_positive())
                .unwrap_or(ExecutionStatus::Error);
            return self
                .complete_state(
                    &instance.id,
                    status,
                    Some("approval ended without a decision".to_string()),
                    Vec::new(),
                )
                .await;
        };

        self.update_instance(&instance.id, |i| {
            if let Some(StepExecutionData::Approval {
                approved: recorded,
                approver: who,
                comments: notes,
                ..
            }) = &mut i.step_data
            {
                *recorded = Some(approved);
                *who = approver.clone();
                *notes = comments.clone();
            }
        })?;

        let by = approver.as_deref().unwrap_or("unknown approver");
        if approved {
            info!("'{}' approved by {}", instance.state_name, by);
            return self
                .complete_state(&instance.id, ExecutionStatus::Success, None, Vec::new())
                .await;
        }
        let message = match &comments {
            Some(comments) => format!("rejected by {}: {}", by, comments),
            None => format!("rejected by {}", by),
        };
        self.complete_state(&instance.id, ExecutionStatus::Rejected, Some(message), Vec::new())
            .await
    }

    async fn resume_instance(self: &Arc<Self>, resumption: Resumption) -> Result<()> {
        let instance = self.instance(&resumption.instance_id)?;
        if instance.status.is_terminal() || !self.is_live(&instance.execution_id) {
            debug!(
                "Dropping resumption of {} ({})",
                instance.state_name, instance.status
            );
            return Ok(());
        }
        let definition = self.definition(&instance.execution_id)?;

        let delay_id = format!("delay:{}", instance.id);
        if !instance.delay_elapsed && resumption.responses.contains_key(&delay_id) {
            self.update_instance(&instance.id, |i| i.delay_elapsed = true)?;
            return self.enter_state(&instance.id, &definition).await;
        }

        if instance.is_root() || instance.state_type.is_composite() {
            return self
                .on_children_complete(instance, &definition, resumption)
                .await;
        }

        self.update_instance(&instance.id, |i| {
            i.advance(ExecutionStatus::Running);
            i.correlation_ids.clear();
        })?;
        debug!("Resuming '{}'", instance.state_name);

        match instance.state_type {
            StateType::Step => {
                let state = self.state_of(&definition, &instance)?;
                self.finish_step(instance, state, resumption).await
            }
            StateType::Approval => self.finish_approval(instance, resumption).await,
            _ => {
                let rejected = resumption.responses.values().find_map(|response| match response {
                    NotifyResponseData::PermitRejected { resource, message } => Some((resource, message)),
                    _ => None,
                });
                if let Some((resource, message)) = rejected {
                    warn!("'{}' can no longer be granted '{}': {}", instance.state_name, resource, message);
                    return self
                        .complete_state(
                            &instance.id,
                            ExecutionStatus::Failed,
                            Some(format!("resource '{}': {}", resource, message)),
                            vec![FailureType::Admission],
                        )
                        .await;
                }

                let status = resumption
                    .responses
                    .values()
                    .filter_map(|r| r.status())
                    .find(|s| !s.is_positive())
                    .unwrap_or(ExecutionStatus::Success);

                if status.is_positive() && instance.state_type == StateType::ResourceConstraint {
                    let state = self.state_of(&definition, &instance)?;
                    if let Some(usage) = &state.constraint {
                        info!("'{}' granted '{}'", instance.state_name, usage.resource);
                        self.hold_permit(&instance, usage.scope, &usage.resource)?;
                    }
                }

                let message = match status {
                    ExecutionStatus::Aborted => Some("released by abort".to_string()),
                    ExecutionStatus::Expired => Some("timed out".to_string()),
                    _ => None,
                };
                self.complete_state(&instance.id, status, message, Vec::new()).await
            }
        }
    }

    async fn finish_step(
        self: &Arc<Self>,
        instance: StateExecutionInstance,
        state: &State,
        resumption: Resumption,
    ) -> Result<()> {
        if resumption.timed_out {
            let missing: Vec<&str> = resumption
                .responses
                .iter()
                .filter(|(_, r)| matches!(r, NotifyResponseData::TimedOut))
                .map(|(id, _)| id.as_str())
                .collect();
            return self
                .complete_state(
                    &instance.id,
                    ExecutionStatus::Expired,
                    Some(format!("timed out waiting for {}", missing.join(", "))),
                    vec![FailureType::Timeout],
                )
                .await;
        }

        let spec = self.step_spec(state)?;
        let executor = self
            .executors
            .get(&spec.kind)
            .cloned()
            .ok_or(EngineError::NoExecutor(spec.kind))?;
        let request = match self.step_request(&instance, spec) {
            Ok(request) => request,
            Err(e @ EngineError::Resolution(_)) => return self.fail_unresolved(&instance, e).await,
            Err(e) => return Err(e),
        };

        match executor.resume(&request, &resumption.responses).await {
            Ok(outcome) => self.apply_outcome(&instance, outcome).await,
            Err(e) => {
                self.complete_state(
                    &instance.id,
                    ExecutionStatus::Error,
                    Some(e.to_string()),
                    vec![FailureType::Application],
                )
                .await
            }
        }
    }

    /// Fails a step whose inputs cannot be resolved; never retried.
    async fn fail_unresolved(self: &Arc<Self>, instance: &StateExecutionInstance, e: EngineError) -> Result<()> {
        warn!("Step '{}' cannot resolve its inputs: {}", instance.state_name, e);
        self.complete_state(
            &instance.id,
            ExecutionStatus::Failed,
            Some(e.to_string()),
            vec![FailureType::Resolution],
        )
        .await
    }

    fn step_request(&self, instance: &StateExecutionInstance, spec: &StepSpec) -> Result<StepRequest> {
        let context = self.context_for(instance);
        let inputs = context.render_all(&spec.inputs)?;
        let bindings = context.project()?;
        Ok(StepRequest {
            execution_id: instance.execution_id.clone(),
            instance_id: instance.id.clone(),
            state_name: instance.state_name.clone(),
            kind: spec.kind,
            inputs,
            rollback: instance.rollback,
            retry_count: instance.retry_count,
            bindings,
        })
    }

    /// Context view of an instance, built from its element ids.
    pub(super) fn context_for(&self, instance: &StateExecutionInstance) -> ExecutionContext {
        let mut stack = ContextStack::new();
        for id in &instance.context_stack {
            if let Some(entry) = self.elements.get(id) {
                let (owner, element) = entry.value();
                stack.push(owner.clone(), element.clone());
            }
        }
        ExecutionContext::new(stack, Arc::clone(&self.resolver))
    }

    async fn store_element(&self, execution_id: &str, owner: &str, element: ContextElement) -> String {
        let id = element.id.clone();
        let stored = StoredElement {
            execution_id: execution_id.to_string(),
            owner_instance_id: owner.to_string(),
            element,
        };
        if let Err(e) = self.store.save_element(&stored).await {
            error!("Failed to persist context element {}: {}", id, e);
        }
        self.elements
            .insert(id.clone(), (stored.owner_instance_id, stored.element));
        id
    }

    /// Moves an instance to WAITING on `correlation_ids`. If the instance
    /// already ended, its waits are dropped and false is returned.
    fn set_waiting(&self, id: &str, correlation_ids: Vec<String>) -> Result<bool> {
        let waiting = self.update_instance(id, |i| {
            let moved = i.advance(ExecutionStatus::Waiting);
            if moved {
                i.correlation_ids = correlation_ids;
            }
            moved
        })?;
        if !waiting {
            self.registry.cancel_instance(id);
        }
        Ok(waiting)
    }

    // --- lookups and bookkeeping ---

    pub(super) fn instance(&self, id: &str) -> Result<StateExecutionInstance> {
        self.instances
            .get(id)
            .map(|i| i.clone())
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))
    }

    pub(super) fn update_instance<R>(&self, id: &str, f: impl FnOnce(&mut StateExecutionInstance) -> R) -> Result<R> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))?;
        Ok(f(entry.value_mut()))
    }

    pub(super) fn instances_of(&self, execution_id: &str) -> Vec<StateExecutionInstance> {
        let mut instances: Vec<_> = self
            .instances
            .iter()
            .filter(|i| i.execution_id == execution_id)
            .map(|i| i.clone())
            .collect();
        instances.sort_by_key(|i| i.created_at);
        instances
    }

    /// Ancestors of an instance, nearest first.
    pub(super) fn ancestors(&self, instance: &StateExecutionInstance) -> Vec<StateExecutionInstance> {
        let mut ancestors = Vec::new();
        let mut next = instance.parent_instance_id.clone();
        while let Some(id) = next {
            let Some(parent) = self.instances.get(&id).map(|p| p.clone()) else {
                break;
            };
            next = parent.parent_instance_id.clone();
            ancestors.push(parent);
        }
        ancestors
    }

    pub(super) fn definition(&self, execution_id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.definitions
            .get(execution_id)
            .map(|d| Arc::clone(d.value()))
            .ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))
    }

    pub(super) fn execution_record(&self, execution_id: &str) -> Result<WorkflowExecution> {
        self.executions
            .get(execution_id)
            .map(|e| e.clone())
            .ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))
    }

    /// True while an execution still accepts transitions.
    pub(super) fn is_live(&self, execution_id: &str) -> bool {
        self.executions
            .get(execution_id)
            .map(|e| !e.status.is_terminal() && e.status != ExecutionStatus::Discontinuing)
            .unwrap_or(false)
    }

    pub(super) fn state_of<'a>(
        &self,
        definition: &'a WorkflowDefinition,
        instance: &StateExecutionInstance,
    ) -> Result<&'a State> {
        definition
            .state_at(&instance.machine_path, &instance.state_name)
            .ok_or_else(|| EngineError::UnknownState {
                machine: instance.machine_path.to_string(),
                state: instance.state_name.clone(),
            })
    }

    pub(super) fn child_machine<'a>(&self, state: &'a State, mode: ExecutionMode) -> Result<&'a StateMachine> {
        state
            .child_machine(mode)
            .ok_or_else(|| EngineError::UnknownMachine(format!("{} ({:?})", state.name, mode)))
    }

    fn step_spec<'a>(&self, state: &'a State) -> Result<&'a StepSpec> {
        state.step.as_ref().ok_or_else(|| EngineError::UnknownState {
            machine: "step".to_string(),
            state: state.name.clone(),
        })
    }

    fn missing(&self, instance: &StateExecutionInstance, what: &str) -> EngineError {
        EngineError::Executor(format!("state '{}' has no {}", instance.state_name, what))
    }

    pub(super) fn dispatch(&self, id: &str) {
        if self.work.send(Work::Start(id.to_string())).is_err() {
            warn!("Engine stopped; instance {} not started", id);
        }
    }

    pub(super) fn record(&self, instance: &StateExecutionInstance, event: EventType) {
        if let Some(mut timeline) = self.timelines.get_mut(&instance.execution_id) {
            timeline.add_event(&instance.id, &instance.state_name, event);
        }
    }

    pub(super) fn wake_barrier_waiters(&self, key: &str, waiters: Vec<crate::sync::BarrierWaiter>, status: ExecutionStatus) {
        for waiter in waiters {
            // Branches that ended without waiting have nothing to wake.
            if self.registry.is_pending(&waiter.correlation_id) {
                self.registry.notify(
                    &waiter.correlation_id,
                    NotifyResponseData::BarrierReleased {
                        key: key.to_string(),
                        status,
                    },
                );
            }
        }
    }

    /// Waiter ids of the unfinished permit states of a holder.
    fn permit_waiters(&self, resource: &str, holder: &str, execution_id: &str) -> Vec<String> {
        self.instances
            .iter()
            .filter(|i| i.execution_id == execution_id && !i.status.is_terminal())
            .filter(|i| {
                matches!(
                    &i.step_data,
                    Some(StepExecutionData::ResourceConstraint { resource: r, holder: h, .. })
                        if r == resource && h == holder
                )
            })
            .map(|i| constraint::waiter_id(resource, holder, &i.id))
            .filter(|id| self.registry.is_pending(id))
            .collect()
    }

    pub(super) async fn deliver_grants(&self, grants: Vec<Grant>) {
        for grant in grants {
            let waiters = self.permit_waiters(&grant.resource, &grant.requester_id, &grant.execution_id);
            info!(
                "Granted {} unit(s) of '{}' to queued {} ({} waiting state(s))",
                grant.units,
                grant.resource,
                grant.requester_id,
                waiters.len()
            );
            for waiter in waiters {
                self.registry.notify(
                    &waiter,
                    NotifyResponseData::PermitGranted {
                        resource: grant.resource.clone(),
                    },
                );
            }
            self.save_constraint(&grant.resource).await;
        }
    }

    pub(super) fn deliver_rejections(&self, rejections: Vec<Rejection>) {
        for rejection in rejections {
            for waiter in self.permit_waiters(&rejection.resource, &rejection.requester_id, &rejection.execution_id) {
                self.registry.notify(
                    &waiter,
                    NotifyResponseData::PermitRejected {
                        resource: rejection.resource.clone(),
                        message: rejection.message.clone(),
                    },
                );
            }
        }
    }

    /// Drops a settled execution from memory; the store keeps its records.
    pub(super) fn evict(&self, execution_id: &str) {
        let settled = self
            .executions
            .get(execution_id)
            .map(|e| e.status.is_terminal())
            .unwrap_or(false);
        if !settled {
            return;
        }
        let owners: HashSet<String> = self
            .instances
            .iter()
            .filter(|i| i.execution_id == execution_id)
            .map(|i| i.id.clone())
            .collect();
        self.instances.retain(|id, _| !owners.contains(id));
        self.elements.retain(|_, (owner, _)| !owners.contains(owner));
        self.definitions.remove(execution_id);
        self.plans.remove(execution_id);
        self.timelines.remove(execution_id);
        self.completions.remove(execution_id);
        self.executions.remove(execution_id);
        let pruned = self.registry.prune_tombstones(self.config.tombstone_retention());
        debug!(
            "Evicted execution {} ({} instance(s), {} correlation id(s) pruned)",
            execution_id,
            owners.len(),
            pruned
        );
    }

    /// Schedules eviction of a settled execution after the retention
    /// period.
    pub(super) fn schedule_eviction(&self, execution_id: &str) {
        let work = self.work.clone();
        let execution_id = execution_id.to_string();
        let retention = self.config.execution_retention();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if work.send(Work::Evict(execution_id)).is_err() {
                debug!("Engine stopped before eviction");
            }
        });
    }

    pub(super) async fn persist_instance(&self, id: &str) {
        let Some(instance) = self.instances.get(id).map(|i| i.clone()) else {
            return;
        };
        if let Err(e) = self.store.save_instance(&instance).await {
            error!("Failed to persist instance {}: {}", id, e);
        }
    }

    pub(super) async fn persist_execution(&self, id: &str) {
        let Some(execution) = self.executions.get(id).map(|e| e.clone()) else {
            return;
        };
        if let Err(e) = self.store.save_execution(&execution).await {
            error!("Failed to persist execution {}: {}", id, e);
        }
    }

    pub(super) async fn save_barrier(&self, execution_id: &str, key: &str) {
        let Some(snapshot) = self.barriers.snapshot(execution_id, key) else {
            return;
        };
        if let Err(e) = self.store.save_barrier(&snapshot).await {
            error!("Failed to persist barrier '{}': {}", key, e);
        }
    }

    pub(super) async fn save_constraint(&self, resource: &str) {
        let Some(snapshot) = self.constraints.snapshot(resource) else {
            return;
        };
        if let Err(e) = self.store.save_constraint(&snapshot).await {
            error!("Failed to persist constraint '{}': {}", resource, e);
        }
    }
}
