//! Execution interrupts: abort, expire, pause and resume.

use std::cmp::Reverse;

use log::{info, warn};

use super::engine::EngineInner;
use crate::error::{EngineError, Result};
use crate::monitoring::EventType;
use crate::sync::NotifyResponseData;
use crate::workflow::status::ExecutionStatus;

impl EngineInner {
    /// Discontinues every unfinished instance of an execution, deepest
    /// first, and settles the execution with `final_status`.
    pub(super) async fn abort_execution(
        &self,
        execution_id: &str,
        final_status: ExecutionStatus,
        reason: String,
    ) -> Result<()> {
        {
            let mut execution = self
                .executions
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))?;
            if !execution.status.can_transition_to(ExecutionStatus::Discontinuing) {
                info!("Execution {} already {}; nothing to interrupt", execution_id, execution.status);
                return Ok(());
            }
            execution.status = ExecutionStatus::Discontinuing;
            execution.error_message = Some(reason.clone());
        }
        warn!("Discontinuing execution {}: {}", execution_id, reason);
        self.persist_execution(execution_id).await;

        let mut pending: Vec<_> = self
            .instances_of(execution_id)
            .into_iter()
            .filter(|i| !i.status.is_terminal())
            .collect();
        pending.sort_by_key(|i| (i.is_root(), Reverse(i.machine_path.depth())));

        for instance in pending {
            self.registry.cancel_instance(&instance.id);
            let discontinued = self.update_instance(&instance.id, |i| {
                i.advance(ExecutionStatus::Discontinuing);
                if !i.advance(final_status) {
                    return None;
                }
                i.error_message.get_or_insert_with(|| reason.clone());
                i.held_permits.clear();
                Some(i.clone())
            })?;
            let Some(instance) = discontinued else {
                continue;
            };
            info!("State '{}' {}", instance.state_name, final_status);
            self.record(&instance, EventType::Aborted);
            self.persist_instance(&instance.id).await;
            self.write_summary(&instance).await;
        }

        for waiter in self.barriers.force_release(execution_id) {
            if self.registry.is_pending(&waiter.correlation_id) {
                self.registry
                    .notify(&waiter.correlation_id, NotifyResponseData::Aborted);
            }
        }

        self.finish_execution(execution_id, final_status).await
    }

    /// Holds back state entries until the execution is resumed. Waiting
    /// states keep waiting.
    pub(super) async fn pause_execution(&self, execution_id: &str) -> Result<()> {
        {
            let mut execution = self
                .executions
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))?;
            if execution.status.is_terminal() || execution.status == ExecutionStatus::Discontinuing {
                return Err(EngineError::InvalidTransition {
                    instance: execution_id.to_string(),
                    from: execution.status,
                    to: ExecutionStatus::Paused,
                });
            }
            execution.paused = true;
            execution.status = ExecutionStatus::Paused;
        }
        info!("Execution {} paused", execution_id);
        self.persist_execution(execution_id).await;
        Ok(())
    }

    /// Lifts a pause and restarts every state it held back.
    pub(super) async fn resume_execution(&self, execution_id: &str) -> Result<()> {
        {
            let mut execution = self
                .executions
                .get_mut(execution_id)
                .ok_or_else(|| EngineError::UnknownExecution(execution_id.to_string()))?;
            if !execution.paused {
                return Ok(());
            }
            execution.paused = false;
            execution.status = ExecutionStatus::Running;
        }
        self.persist_execution(execution_id).await;

        let held: Vec<String> = self
            .instances_of(execution_id)
            .into_iter()
            .filter(|i| i.status == ExecutionStatus::Paused)
            .map(|i| i.id)
            .collect();
        info!("Execution {} resumed; restarting {} state(s)", execution_id, held.len());

        for id in held {
            if self.update_instance(&id, |i| i.advance(ExecutionStatus::Resumed))? {
                self.persist_instance(&id).await;
                self.dispatch(&id);
            }
        }
        Ok(())
    }
}
