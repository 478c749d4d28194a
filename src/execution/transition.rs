//! State completion and transitions.
//!
//! Once an instance reaches a terminal status the engine either follows a
//! transition to the next state of the branch, applies a failure strategy,
//! or ends the branch and reports to the parent.

use std::sync::Arc;

use log::{debug, error, info, warn};

use super::engine::EngineInner;
use crate::error::{EngineError, Result};
use crate::monitoring::EventType;
use crate::sync::{ArrivalOutcome, NotifyResponseData, Resumption};
use crate::workflow::model::{ExecutionMode, State, StateType, TransitionType};
use crate::workflow::status::{ExecutionStatus, FailureType};
use crate::workflow::step_data::StepExecutionSummary;
use crate::workflow::strategy::{select_strategy, FailureAction, FailureStrategy};
use crate::workflow::{StateExecutionInstance, WorkflowDefinition};

impl EngineInner {
    /// Moves an instance to a terminal status and decides what follows.
    ///
    /// Completing an instance that already ended is a no-op.
    pub(super) async fn complete_state(
        self: &Arc<Self>,
        id: &str,
        status: ExecutionStatus,
        error_message: Option<String>,
        mut failure_types: Vec<FailureType>,
    ) -> Result<()> {
        if status.is_broken() && failure_types.is_empty() {
            failure_types.push(match status {
                ExecutionStatus::Expired => FailureType::Timeout,
                _ => FailureType::Application,
            });
        }

        let completed = self.update_instance(id, |i| {
            if !i.advance(status) {
                return None;
            }
            if error_message.is_some() {
                i.error_message = error_message;
            }
            if !status.is_positive() {
                i.failure_types = failure_types;
            }
            Some(i.clone())
        })?;
        let Some(instance) = completed else {
            debug!("Instance {} already ended; ignoring {}", id, status);
            return Ok(());
        };

        if status.is_positive() {
            info!("State '{}' completed: {}", instance.state_name, status);
            self.record(&instance, EventType::Completed);
        } else {
            warn!(
                "State '{}' ended {}: {}",
                instance.state_name,
                status,
                instance.error_message.as_deref().unwrap_or("no details")
            );
            let event = match status {
                ExecutionStatus::Aborted => EventType::Aborted,
                _ => EventType::Failed,
            };
            self.record(&instance, event);
        }

        self.persist_instance(id).await;
        self.write_summary(&instance).await;
        self.release_permits(&instance).await;
        self.route_completion(&instance).await
    }

    /// Decides what follows an instance that reached a terminal status.
    pub(super) async fn route_completion(self: &Arc<Self>, instance: &StateExecutionInstance) -> Result<()> {
        let status = instance.status;
        if instance.is_root() {
            return self.finish_execution(&instance.execution_id, status).await;
        }
        if !self.is_live(&instance.execution_id) {
            return Ok(());
        }

        if status.is_positive() {
            self.success_transition(instance).await
        } else if status == ExecutionStatus::Aborted {
            self.end_branch(instance, status).await
        } else {
            self.handle_failure(instance).await
        }
    }

    pub(super) async fn write_summary(&self, instance: &StateExecutionInstance) {
        let Some(summary) = StepExecutionSummary::from_instance(instance) else {
            return;
        };
        match self.store.record_summary(&summary).await {
            Ok(true) => {}
            Ok(false) => debug!("Summary of {} already recorded", instance.id),
            Err(e) => error!("Failed to record summary of {}: {}", instance.id, e),
        }
    }

    /// Releases the permits an ending instance holds for its scope.
    async fn release_permits(&self, instance: &StateExecutionInstance) {
        if instance.held_permits.is_empty() {
            return;
        }
        let holder = if instance.is_root() {
            instance.execution_id.clone()
        } else {
            instance.id.clone()
        };
        let resources = instance.held_permits.clone();
        if let Err(e) = self.update_instance(&instance.id, |i| i.held_permits.clear()) {
            warn!("Could not clear permits of {}: {}", instance.id, e);
        }

        for resource in resources {
            match self.constraints.release(&resource, &holder) {
                Ok(grants) => {
                    info!("'{}' released '{}'", instance.state_name, resource);
                    self.save_constraint(&resource).await;
                    self.deliver_grants(grants).await;
                }
                Err(e) => warn!("Releasing '{}' for {} failed: {}", resource, holder, e),
            }
        }
    }

    /// Follows the success transition, or ends the branch.
    async fn success_transition(self: &Arc<Self>, instance: &StateExecutionInstance) -> Result<()> {
        let definition = self.definition(&instance.execution_id)?;
        let machine = definition
            .machine_at(&instance.machine_path)
            .ok_or_else(|| EngineError::UnknownMachine(instance.machine_path.to_string()))?;

        match machine.next_state(&instance.state_name, TransitionType::Success) {
            Some(next) => self.follow(instance, next).await,
            None => self.end_branch(instance, ExecutionStatus::Success).await,
        }
    }

    /// Starts the state that follows `instance` in its branch.
    async fn follow(&self, instance: &StateExecutionInstance, next: &State) -> Result<()> {
        let mut successor = StateExecutionInstance::new(&instance.execution_id, next, instance.machine_path.clone());
        successor.parent_instance_id = instance.parent_instance_id.clone();
        successor.notify_id = instance.notify_id.clone();
        successor.branch = instance.branch.clone();
        successor.rollback = instance.rollback;
        successor.prev_instance_id = Some(instance.id.clone());
        successor.context_stack = instance.successor_context();

        debug!("'{}' -> '{}'", instance.state_name, next.name);
        self.adopt(successor).await
    }

    /// Registers a new instance under its parent and schedules it.
    async fn adopt(&self, instance: StateExecutionInstance) -> Result<()> {
        let id = instance.id.clone();
        if let Some(parent_id) = &instance.parent_instance_id {
            self.update_instance(parent_id, |p| p.child_instance_ids.push(id.clone()))?;
        }
        self.instances.insert(id.clone(), instance);
        self.persist_instance(&id).await;
        self.dispatch(&id);
        Ok(())
    }

    /// Ends the branch `instance` belongs to.
    ///
    /// A top-level branch arrives at every barrier it has not reached yet
    /// so the other participants are not held forever.
    pub(super) async fn end_branch(&self, instance: &StateExecutionInstance, status: ExecutionStatus) -> Result<()> {
        if instance.is_root() {
            return self.finish_execution(&instance.execution_id, status).await;
        }

        if instance.machine_path.is_root() {
            let participant = instance
                .branch
                .clone()
                .unwrap_or_else(|| instance.state_name.clone());
            for key in self.barriers.pending_for(&instance.execution_id, &participant) {
                info!("Branch '{}' ended {}; arriving at barrier '{}'", participant, status, key);
                match self
                    .barriers
                    .arrive(&instance.execution_id, &key, &participant, status)
                {
                    Ok(ArrivalOutcome::Released { waiters, .. }) => {
                        self.wake_barrier_waiters(&key, waiters, ExecutionStatus::Success)
                    }
                    Ok(ArrivalOutcome::Waiting { .. }) => {}
                    Err(e) => warn!("Force arrival at barrier '{}' failed: {}", key, e),
                }
                self.save_barrier(&instance.execution_id, &key).await;
            }
        }

        if let Some(notify_id) = &instance.notify_id {
            debug!("Branch of '{}' ended {}", instance.state_name, status);
            self.registry.notify(
                notify_id,
                NotifyResponseData::ChildCompleted {
                    instance_id: instance.id.clone(),
                    status,
                    error_message: instance.error_message.clone(),
                },
            );
        }
        Ok(())
    }

    /// Applies the failure strategy selected for a broken instance.
    async fn handle_failure(self: &Arc<Self>, instance: &StateExecutionInstance) -> Result<()> {
        let definition = self.definition(&instance.execution_id)?;
        if instance.rollback_started {
            return self.end_branch(instance, instance.status).await;
        }

        let state = self.state_of(&definition, instance)?;
        let ancestors = self.ancestors(instance);
        let mut action = self
            .select_action(&definition, state, &ancestors, &instance.failure_types)
            .cloned();

        while let Some(current) = action.take() {
            let backoff = current.backoff_for(instance.retry_count);
            match current {
                FailureAction::Retry { attempts, then, .. } => {
                    let retryable = instance.failure_types.iter().all(|t| t.is_retryable());
                    if retryable && instance.retry_count < attempts {
                        info!(
                            "Retrying '{}' ({}/{}) in {:?}",
                            instance.state_name,
                            instance.retry_count + 1,
                            attempts,
                            backoff
                        );
                        return self.retry(instance, backoff).await;
                    }
                    if !retryable {
                        info!("'{}' failed with a non-retryable failure", instance.state_name);
                    }
                    action = then.map(|next| *next);
                }
                FailureAction::Continue => {
                    info!("Continuing past failed state '{}'", instance.state_name);
                    return self.success_transition(instance).await;
                }
                FailureAction::FailAfterRemaining => {
                    return self.end_branch(instance, instance.status).await;
                }
                FailureAction::AbortWorkflow => {
                    let reason = format!(
                        "state '{}' ended {}",
                        instance.state_name, instance.status
                    );
                    return self
                        .abort_execution(&instance.execution_id, ExecutionStatus::Aborted, reason)
                        .await;
                }
                FailureAction::RollbackPhase => {
                    let phase = ancestors.iter().find(|a| a.state_type == StateType::Phase);
                    match phase {
                        Some(phase) => {
                            info!("'{}' failed; phase '{}' will roll back", instance.state_name, phase.state_name);
                            self.update_instance(&phase.id, |p| p.rollback_requested = true)?;
                        }
                        None => warn!("'{}' asked for a rollback outside of any phase", instance.state_name),
                    }
                    return self.end_branch(instance, instance.status).await;
                }
            }
        }

        self.fail_transition(instance, &definition).await
    }

    /// Strategy lookup: the state itself, then enclosing states, then the
    /// workflow. Composite states only consult their own strategies.
    fn select_action<'a>(
        &self,
        definition: &'a WorkflowDefinition,
        state: &'a State,
        ancestors: &[StateExecutionInstance],
        failure_types: &[FailureType],
    ) -> Option<&'a FailureAction> {
        let mut scopes: Vec<&'a [FailureStrategy]> = vec![state.failure_strategies.as_slice()];
        if !state.state_type.is_composite() {
            scopes.extend(
                ancestors
                    .iter()
                    .filter(|a| !a.is_root())
                    .filter_map(|a| definition.state_at(&a.machine_path, &a.state_name))
                    .map(|s| s.failure_strategies.as_slice()),
            );
            scopes.push(definition.failure_strategies.as_slice());
        }
        select_strategy(scopes, failure_types).map(|s| &s.action)
    }

    /// Follows the failure transition, or ends the branch failed.
    async fn fail_transition(&self, instance: &StateExecutionInstance, definition: &WorkflowDefinition) -> Result<()> {
        let next = definition
            .machine_at(&instance.machine_path)
            .and_then(|m| m.next_state(&instance.state_name, TransitionType::Failure));
        match next {
            Some(next) => self.follow(instance, next).await,
            None => self.end_branch(instance, instance.status).await,
        }
    }

    async fn retry(self: &Arc<Self>, instance: &StateExecutionInstance, backoff: std::time::Duration) -> Result<()> {
        let attempt = instance.retry_attempt();
        let attempt_id = attempt.id.clone();
        if let Some(parent_id) = &attempt.parent_instance_id {
            self.update_instance(parent_id, |p| p.child_instance_ids.push(attempt_id.clone()))?;
        }
        self.instances.insert(attempt_id.clone(), attempt);
        self.persist_instance(&attempt_id).await;

        if backoff.is_zero() {
            self.dispatch(&attempt_id);
        } else {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                inner.dispatch(&attempt_id);
            });
        }
        Ok(())
    }

    /// Decides the outcome of a composite once all of its branches ended.
    pub(super) async fn on_children_complete(
        self: &Arc<Self>,
        instance: StateExecutionInstance,
        definition: &WorkflowDefinition,
        resumption: Resumption,
    ) -> Result<()> {
        let mut aborted = false;
        let mut failed = false;
        let mut failure_types: Vec<FailureType> = Vec::new();

        for response in resumption.responses.values() {
            match response {
                NotifyResponseData::ChildCompleted {
                    instance_id, status, ..
                } => {
                    if *status == ExecutionStatus::Aborted {
                        aborted = true;
                    } else if !status.is_positive() {
                        failed = true;
                        let child_types = self
                            .instances
                            .get(instance_id)
                            .map(|c| c.failure_types.clone())
                            .unwrap_or_default();
                        for t in child_types {
                            if !failure_types.contains(&t) {
                                failure_types.push(t);
                            }
                        }
                    }
                }
                other => match other.status() {
                    Some(ExecutionStatus::Aborted) => aborted = true,
                    Some(status) if !status.is_positive() => failed = true,
                    _ => {}
                },
            }
        }

        if instance.rollback_started {
            let message = format!("'{}' was rolled back", instance.state_name);
            let types = instance.failure_types.clone();
            return self
                .complete_state(&instance.id, ExecutionStatus::Failed, Some(message), types)
                .await;
        }

        if failed && !aborted && !instance.is_root() {
            let state = self.state_of(definition, &instance)?;
            if let Some(rollback) = &state.rollback {
                let wants_rollback = instance.rollback_requested
                    || matches!(
                        select_strategy([state.failure_strategies.as_slice()], &failure_types).map(|s| &s.action),
                        Some(FailureAction::RollbackPhase)
                    );
                if wants_rollback {
                    let parent = self.update_instance(&instance.id, |i| {
                        i.rollback_started = true;
                        i.failure_types = failure_types.clone();
                        i.clone()
                    })?;
                    info!("Rolling back '{}'", instance.state_name);
                    return self.fan_out(&parent, rollback, ExecutionMode::Rollback).await;
                }
            }
        }

        let (status, message) = if aborted {
            (ExecutionStatus::Aborted, Some("a branch was aborted".to_string()))
        } else if failed {
            (ExecutionStatus::Failed, Some("failed due to child failure".to_string()))
        } else {
            (ExecutionStatus::Success, None)
        };
        self.complete_state(&instance.id, status, message, failure_types)
            .await
    }

    /// Settles an execution: releases everything it still holds and
    /// publishes its final status.
    pub(super) async fn finish_execution(&self, execution_id: &str, status: ExecutionStatus) -> Result<()> {
        let finished = {
            let mut execution = self
                .executions
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))?;
            if execution.status.can_transition_to(status) {
                execution.status = status;
                execution.paused = false;
                execution.ended_at = Some(chrono::Utc::now());
                true
            } else {
                false
            }
        };
        if !finished {
            return Ok(());
        }

        let grants = self.constraints.release_execution(execution_id);
        self.deliver_grants(grants).await;

        let waiters = self.barriers.force_release(execution_id);
        for waiter in waiters {
            if self.registry.is_pending(&waiter.correlation_id) {
                self.registry
                    .notify(&waiter.correlation_id, NotifyResponseData::Aborted);
            }
        }
        let keys: Vec<String> = self
            .plans
            .get(execution_id)
            .map(|plan| plan.keys().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            self.save_barrier(execution_id, key).await;
        }
        self.barriers.purge(execution_id);

        self.persist_execution(execution_id).await;
        if let Some(tx) = self.completions.get(execution_id) {
            tx.send_replace(Some(status));
        }
        self.schedule_eviction(execution_id);

        match status {
            ExecutionStatus::Success => info!("Execution {} completed successfully", execution_id),
            other => warn!("Execution {} finished: {}", execution_id, other),
        }
        Ok(())
    }
}
