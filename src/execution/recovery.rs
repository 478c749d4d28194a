//! Restart recovery.
//!
//! Rebuilds unfinished executions from the state store: instances,
//! context elements, barriers and permit holdings come back, waits are
//! re-armed with whatever time they had left, and work that was cut off
//! mid-flight is either routed again or failed as interrupted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;

use super::engine::EngineInner;
use crate::error::{EngineError, Result};
use crate::monitoring::ExecutionTimeline;
use crate::sync::{barrier, constraint, AcquireOutcome, BarrierState, NotifyResponseData, Requester};
use crate::workflow::model::StateType;
use crate::workflow::status::{ExecutionStatus, FailureType};
use crate::workflow::step_data::StepExecutionData;
use crate::workflow::validator::validate_definition;
use crate::workflow::{StateExecutionInstance, WorkflowExecution};

/// What a recovered execution still has to do once its waits are armed.
#[derive(Default)]
struct Pending {
    tails: Vec<StateExecutionInstance>,
    interrupted: Vec<String>,
    dispatch: Vec<String>,
}

impl EngineInner {
    /// Loads every unfinished execution from the store and continues it.
    ///
    /// Returns the number of executions recovered. Executions already
    /// tracked in memory are left alone.
    pub(super) async fn recover(self: &Arc<Self>) -> Result<usize> {
        let restored_events = self.events.restore(self.store.load_events().await?);

        let mut recovered = Vec::new();
        for execution in self.store.load_executions().await? {
            if execution.status.is_terminal() || self.executions.contains_key(&execution.id) {
                continue;
            }
            let execution_id = execution.id.clone();
            match self.reload_execution(execution).await {
                Ok(()) => recovered.push(execution_id),
                Err(e) => warn!("Cannot recover execution {}: {}", execution_id, e),
            }
        }

        self.restore_holdings(&recovered).await;
        for execution_id in &recovered {
            if let Err(e) = self.continue_execution(execution_id).await {
                warn!("Recovery of execution {} stopped: {}", execution_id, e);
            }
        }

        info!(
            "Recovered {} execution(s) and {} queued event(s)",
            recovered.len(),
            restored_events
        );
        Ok(recovered.len())
    }

    async fn reload_execution(&self, execution: WorkflowExecution) -> Result<()> {
        let execution_id = execution.id.clone();
        let definition = self
            .store
            .load_definition(&execution_id)
            .await?
            .ok_or_else(|| EngineError::UnknownExecution(execution_id.clone()))?;
        let plan = validate_definition(&definition)?;

        let snapshots = self.store.barriers_for_execution(&execution_id).await?;
        for (key, participants) in &plan {
            match snapshots.iter().find(|s| &s.key == key) {
                Some(snapshot) => self.barriers.restore(snapshot),
                None => self.barriers.define(&execution_id, key, participants.clone())?,
            }
        }

        for stored in self.store.elements_for_execution(&execution_id).await? {
            self.elements
                .insert(stored.element.id.clone(), (stored.owner_instance_id, stored.element));
        }
        let instances = self.store.instances_for_execution(&execution_id).await?;
        debug!(
            "Reloading execution {} ({} instance(s))",
            execution_id,
            instances.len()
        );
        for instance in instances {
            self.instances.insert(instance.id.clone(), instance);
        }

        self.definitions.insert(execution_id.clone(), Arc::new(definition));
        self.plans.insert(execution_id.clone(), plan);
        self.timelines
            .insert(execution_id.clone(), ExecutionTimeline::new(execution_id.clone()));
        self.completions
            .insert(execution_id.clone(), watch::channel(None).0);
        self.executions.insert(execution_id, execution);
        Ok(())
    }

    /// Re-takes the permits granted before the restart, so queued requests
    /// cannot overtake them.
    async fn restore_holdings(&self, execution_ids: &[String]) {
        let mut restored: HashSet<(String, String)> = HashSet::new();
        for execution_id in execution_ids {
            let Ok(execution) = self.execution_record(execution_id) else {
                continue;
            };
            for instance in self.instances_of(execution_id) {
                if instance.status != ExecutionStatus::Success {
                    continue;
                }
                let Some(StepExecutionData::ResourceConstraint {
                    resource, holder, units, ..
                }) = &instance.step_data
                else {
                    continue;
                };
                let owner_id = if holder == execution_id {
                    execution.root_instance_id.as_str()
                } else {
                    holder.as_str()
                };
                let still_held = self
                    .instances
                    .get(owner_id)
                    .map(|o| !o.status.is_terminal() && o.held_permits.iter().any(|r| r == resource))
                    .unwrap_or(false);
                if !still_held || !restored.insert((resource.clone(), holder.clone())) {
                    continue;
                }

                let requester = Requester::new(holder.clone(), execution_id.clone());
                match self.constraints.restore_holding(resource, &requester, *units) {
                    Ok(()) => self.save_constraint(resource).await,
                    Err(e) => warn!("Permit '{}' of {} not restored: {}", resource, holder, e),
                }
            }
        }
    }

    async fn continue_execution(self: &Arc<Self>, execution_id: &str) -> Result<()> {
        let execution = self.execution_record(execution_id)?;
        if execution.status == ExecutionStatus::Discontinuing {
            // An interrupted abort is finished from scratch.
            if let Some(mut record) = self.executions.get_mut(execution_id) {
                record.status = ExecutionStatus::Running;
            }
            let reason = execution
                .error_message
                .unwrap_or_else(|| "aborted before the engine restarted".to_string());
            return self
                .abort_execution(execution_id, ExecutionStatus::Aborted, reason)
                .await;
        }

        let instances = self.instances_of(execution_id);
        let pending = self.classify(&instances, execution.paused);

        for instance in instances.iter().filter(|i| i.status == ExecutionStatus::Waiting) {
            if let Err(e) = self.rearm(instance).await {
                warn!("Could not re-arm '{}' ({}): {}", instance.state_name, instance.id, e);
                self.registry.cancel_instance(&instance.id);
                self.complete_state(
                    &instance.id,
                    ExecutionStatus::Error,
                    Some(format!("wait could not be restored after restart: {}", e)),
                    vec![FailureType::Application],
                )
                .await?;
            }
        }

        for tail in &pending.tails {
            debug!("Routing '{}' ({}) again", tail.state_name, tail.status);
            self.route_completion(tail).await?;
        }

        for id in &pending.interrupted {
            self.registry.cancel_instance(id);
            self.complete_state(
                id,
                ExecutionStatus::Error,
                Some("interrupted by engine restart".to_string()),
                vec![FailureType::Application],
            )
            .await?;
        }

        for id in &pending.dispatch {
            let ready = self.update_instance(id, |i| {
                i.status != ExecutionStatus::Paused || i.advance(ExecutionStatus::Resumed)
            })?;
            if !ready {
                continue;
            }
            self.persist_instance(id).await;
            self.dispatch(id);
        }

        info!(
            "Execution {} recovered: {} branch end(s) routed, {} interrupted, {} restarted",
            execution_id,
            pending.tails.len(),
            pending.interrupted.len(),
            pending.dispatch.len()
        );
        Ok(())
    }

    /// Sorts the instances of a recovered execution by what they still
    /// need, before anything is re-armed.
    fn classify(&self, instances: &[StateExecutionInstance], paused: bool) -> Pending {
        let mut pending = Pending::default();
        for instance in instances {
            match instance.status {
                ExecutionStatus::Running => pending.interrupted.push(instance.id.clone()),
                ExecutionStatus::New | ExecutionStatus::Queued | ExecutionStatus::Resumed => {
                    pending.dispatch.push(instance.id.clone())
                }
                ExecutionStatus::Paused if !paused => pending.dispatch.push(instance.id.clone()),
                ExecutionStatus::Waiting if instance.is_root() || instance.state_type.is_composite() => {
                    if instance.correlation_ids.iter().any(|c| c.starts_with("delay:")) {
                        continue;
                    }
                    let mut started = false;
                    for notify_id in &instance.correlation_ids {
                        let branch: Vec<&StateExecutionInstance> = instances
                            .iter()
                            .filter(|c| c.notify_id.as_deref() == Some(notify_id.as_str()))
                            .collect();
                        started |= !branch.is_empty();
                        let tail = branch
                            .iter()
                            .find(|c| !branch.iter().any(|o| o.prev_instance_id.as_deref() == Some(c.id.as_str())));
                        if let Some(tail) = tail.filter(|t| t.status.is_terminal()) {
                            pending.tails.push((*tail).clone());
                        }
                    }
                    if !started {
                        pending.interrupted.push(instance.id.clone());
                    }
                }
                _ => {}
            }
        }
        pending
    }

    /// Registers the waits of a WAITING instance again and restarts the
    /// timers they depend on.
    async fn rearm(&self, instance: &StateExecutionInstance) -> Result<()> {
        let wait_id = self
            .registry
            .register_wait(&instance.id, instance.correlation_ids.clone())?;

        let delay_id = format!("delay:{}", instance.id);
        if instance.correlation_ids.contains(&delay_id) {
            let definition = self.definition(&instance.execution_id)?;
            let secs = self.state_of(&definition, instance)?.wait_interval_secs;
            self.registry.schedule_notify(
                delay_id,
                NotifyResponseData::DelayElapsed,
                remaining(Some(instance.created_at), Duration::from_secs(secs)),
            );
            return Ok(());
        }
        if instance.is_root() || instance.state_type.is_composite() {
            return Ok(());
        }

        let definition = self.definition(&instance.execution_id)?;
        let state = self.state_of(&definition, instance)?;
        let timeout = state
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.default_step_timeout());

        match (&instance.state_type, &instance.step_data) {
            (StateType::Wait, Some(StepExecutionData::Wait { duration_secs })) => {
                self.registry.schedule_notify(
                    format!("wait:{}", instance.id),
                    NotifyResponseData::DelayElapsed,
                    remaining(instance.started_at, Duration::from_secs(*duration_secs)),
                );
            }
            (StateType::Barrier, Some(StepExecutionData::Barrier { key, participant, .. })) => {
                let released = self
                    .barriers
                    .snapshot(&instance.execution_id, key)
                    .map(|s| s.state == BarrierState::Released)
                    .unwrap_or(false);
                if released {
                    self.registry.notify(
                        &barrier::correlation_id(&instance.execution_id, key, participant),
                        NotifyResponseData::BarrierReleased {
                            key: key.clone(),
                            status: ExecutionStatus::Success,
                        },
                    );
                }
            }
            (
                StateType::ResourceConstraint,
                Some(StepExecutionData::ResourceConstraint {
                    resource, holder, units, ..
                }),
            ) => {
                let priority = state.constraint.as_ref().map(|c| c.priority).unwrap_or(0);
                let requester = Requester::new(holder.clone(), instance.execution_id.clone());
                let waiter = constraint::waiter_id(resource, holder, &instance.id);
                match self.constraints.acquire(resource, &requester, *units, priority) {
                    Ok(AcquireOutcome::Granted) => {
                        self.registry.notify(
                            &waiter,
                            NotifyResponseData::PermitGranted {
                                resource: resource.clone(),
                            },
                        );
                    }
                    Ok(AcquireOutcome::Queued { .. }) => {}
                    Err(e) => {
                        self.registry.notify(
                            &waiter,
                            NotifyResponseData::PermitRejected {
                                resource: resource.clone(),
                                message: e.to_string(),
                            },
                        );
                    }
                }
                self.save_constraint(resource).await;
            }
            (StateType::Step, _) | (StateType::Approval, _) => {
                self.registry
                    .schedule_timeout(wait_id, remaining(instance.started_at, timeout));
            }
            (other, _) => {
                return Err(EngineError::Executor(format!(
                    "cannot resume a waiting {:?} state without its step data",
                    other
                )));
            }
        }
        Ok(())
    }
}

/// Time left of `total` counted from `since`; zero once it has passed.
fn remaining(since: Option<DateTime<Utc>>, total: Duration) -> Duration {
    let Some(since) = since else {
        return total;
    };
    let elapsed = Utc::now()
        .signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO);
    total.saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_counts_down_and_saturates() {
        let total = Duration::from_secs(60);
        assert_eq!(remaining(None, total), total);

        let left = remaining(Some(Utc::now() - chrono::Duration::seconds(20)), total);
        assert!(left <= Duration::from_secs(40));
        assert!(left > Duration::from_secs(35));

        let gone = remaining(Some(Utc::now() - chrono::Duration::seconds(120)), total);
        assert_eq!(gone, Duration::ZERO);
    }
}
