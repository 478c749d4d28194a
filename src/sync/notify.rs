//! Notify/Wait Registry
//!
//! A state instance that cannot finish synchronously registers a wait on
//! one or more correlation ids and yields. External systems (or the engine
//! itself) later notify those ids. Once every id of a wait has a response
//! the wait resumes exactly once with all responses.
//!
//! Resolved ids are tombstoned, so duplicate or late notifications are
//! reported as `AlreadyResolved` instead of being applied twice.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::workflow::status::ExecutionStatus;

/// Payload delivered to a waiting instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyResponseData {
    /// Result of an asynchronous step task
    StepResult {
        status: ExecutionStatus,
        #[serde(default)]
        error_message: Option<String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    /// A child branch of a composite ended
    ChildCompleted {
        instance_id: String,
        status: ExecutionStatus,
        #[serde(default)]
        error_message: Option<String>,
    },
    BarrierReleased {
        key: String,
        status: ExecutionStatus,
    },
    PermitGranted {
        resource: String,
    },
    /// A queued permit request can no longer be granted
    PermitRejected {
        resource: String,
        message: String,
    },
    /// Decision on a human approval
    Approval {
        approved: bool,
        #[serde(default)]
        approver: Option<String>,
        #[serde(default)]
        comments: Option<String>,
    },
    DelayElapsed,
    TimedOut,
    Aborted,
}

impl NotifyResponseData {
    pub fn step_success() -> Self {
        Self::StepResult {
            status: ExecutionStatus::Success,
            error_message: None,
            data: None,
        }
    }

    pub fn step_failure(message: impl Into<String>) -> Self {
        Self::StepResult {
            status: ExecutionStatus::Failed,
            error_message: Some(message.into()),
            data: None,
        }
    }

    pub fn approve(approver: impl Into<String>) -> Self {
        Self::Approval {
            approved: true,
            approver: Some(approver.into()),
            comments: None,
        }
    }

    pub fn reject(approver: impl Into<String>, comments: impl Into<String>) -> Self {
        Self::Approval {
            approved: false,
            approver: Some(approver.into()),
            comments: Some(comments.into()),
        }
    }

    /// Status the response reports, where it carries one.
    pub fn status(&self) -> Option<ExecutionStatus> {
        match self {
            Self::StepResult { status, .. }
            | Self::ChildCompleted { status, .. }
            | Self::BarrierReleased { status, .. } => Some(*status),
            Self::PermitGranted { .. } | Self::DelayElapsed => Some(ExecutionStatus::Success),
            Self::PermitRejected { .. } => Some(ExecutionStatus::Failed),
            Self::Approval { approved: true, .. } => Some(ExecutionStatus::Success),
            Self::Approval { approved: false, .. } => Some(ExecutionStatus::Rejected),
            Self::TimedOut => Some(ExecutionStatus::Expired),
            Self::Aborted => Some(ExecutionStatus::Aborted),
        }
    }
}

/// Result of delivering a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Last outstanding id of the wait; the instance resumes
    Resumed,
    /// Recorded, other ids of the wait are still outstanding
    Recorded,
    /// The id (or its wait) was already resolved; nothing happened
    AlreadyResolved,
    /// No wait ever registered this id
    Unknown,
}

/// Delivered to the resumption sink when a wait completes.
#[derive(Debug, Clone)]
pub struct Resumption {
    pub wait_id: String,
    pub instance_id: String,
    pub responses: BTreeMap<String, NotifyResponseData>,
    pub timed_out: bool,
}

#[derive(Debug)]
struct WaitEntry {
    instance_id: String,
    correlation_ids: Vec<String>,
    responses: BTreeMap<String, NotifyResponseData>,
    resolved: bool,
}

type ResumeSink = Box<dyn Fn(Resumption) + Send + Sync>;

pub struct NotifyRegistry {
    waits: DashMap<String, Arc<Mutex<WaitEntry>>>,
    /// correlation id -> wait id
    by_correlation: DashMap<String, String>,
    /// instance id -> wait ids
    by_instance: DashMap<String, Vec<String>>,
    /// resolved correlation ids
    tombstones: DashMap<String, DateTime<Utc>>,
    sink: ResumeSink,
}

fn lock(entry: &Mutex<WaitEntry>) -> MutexGuard<'_, WaitEntry> {
    entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl NotifyRegistry {
    /// Creates a registry that hands completed waits to `sink`.
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(Resumption) + Send + Sync + 'static,
    {
        Self {
            waits: DashMap::new(),
            by_correlation: DashMap::new(),
            by_instance: DashMap::new(),
            tombstones: DashMap::new(),
            sink: Box::new(sink),
        }
    }

    /// Registry paired with a channel receiving its resumptions.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Resumption>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self::new(move |resumption| {
            if tx.send(resumption).is_err() {
                warn!("Resumption receiver dropped");
            }
        });
        (registry, rx)
    }

    /// Registers a fan-in wait of `instance_id` on all `correlation_ids`.
    ///
    /// Fails if the list is empty or any id is already awaited by another
    /// wait. A tombstoned id may be awaited again.
    pub fn register_wait(&self, instance_id: &str, correlation_ids: Vec<String>) -> Result<String> {
        if correlation_ids.is_empty() {
            return Err(EngineError::Synchronization(format!(
                "instance {} registered a wait without correlation ids",
                instance_id
            )));
        }

        let wait_id = Uuid::new_v4().to_string();
        let mut claimed: Vec<String> = Vec::with_capacity(correlation_ids.len());
        let mut conflict = None;
        for correlation_id in &correlation_ids {
            match self.by_correlation.entry(correlation_id.clone()) {
                Entry::Occupied(_) => {
                    conflict = Some(correlation_id.clone());
                    break;
                }
                Entry::Vacant(slot) => {
                    slot.insert(wait_id.clone());
                    claimed.push(correlation_id.clone());
                }
            }
        }
        if let Some(conflicting) = conflict {
            for id in &claimed {
                self.by_correlation.remove(id);
            }
            return Err(EngineError::Synchronization(format!(
                "correlation id '{}' is already awaited",
                conflicting
            )));
        }

        for correlation_id in &correlation_ids {
            self.tombstones.remove(correlation_id);
        }
        self.waits.insert(
            wait_id.clone(),
            Arc::new(Mutex::new(WaitEntry {
                instance_id: instance_id.to_string(),
                correlation_ids,
                responses: BTreeMap::new(),
                resolved: false,
            })),
        );
        self.by_instance
            .entry(instance_id.to_string())
            .or_default()
            .push(wait_id.clone());

        debug!("Instance {} waiting on {} ({})", instance_id, claimed.join(", "), wait_id);
        Ok(wait_id)
    }

    /// Delivers a response for one correlation id.
    pub fn notify(&self, correlation_id: &str, data: NotifyResponseData) -> NotifyOutcome {
        let wait_id = match self.by_correlation.get(correlation_id) {
            Some(wait_id) => wait_id.value().clone(),
            None if self.tombstones.contains_key(correlation_id) => {
                debug!("Ignoring duplicate notification for {}", correlation_id);
                return NotifyOutcome::AlreadyResolved;
            }
            None => {
                warn!("Notification for unknown correlation id {}", correlation_id);
                return NotifyOutcome::Unknown;
            }
        };
        let Some(entry) = self.waits.get(&wait_id).map(|e| Arc::clone(e.value())) else {
            return NotifyOutcome::AlreadyResolved;
        };

        let resumption = {
            let mut wait = lock(&entry);
            if wait.resolved || wait.responses.contains_key(correlation_id) {
                return NotifyOutcome::AlreadyResolved;
            }
            wait.responses.insert(correlation_id.to_string(), data);
            if wait.responses.len() < wait.correlation_ids.len() {
                return NotifyOutcome::Recorded;
            }
            wait.resolved = true;
            Resumption {
                wait_id: wait_id.clone(),
                instance_id: wait.instance_id.clone(),
                responses: std::mem::take(&mut wait.responses),
                timed_out: false,
            }
        };

        self.retire(&wait_id);
        debug!("Wait {} resolved by {}", wait_id, correlation_id);
        (self.sink)(resumption);
        NotifyOutcome::Resumed
    }

    /// Resolves a wait that ran out of time; outstanding ids get `TimedOut`.
    ///
    /// Returns false if the wait had already been resolved or cancelled.
    pub fn expire(&self, wait_id: &str) -> bool {
        let Some(entry) = self.waits.get(wait_id).map(|e| Arc::clone(e.value())) else {
            return false;
        };

        let resumption = {
            let mut wait = lock(&entry);
            if wait.resolved {
                return false;
            }
            wait.resolved = true;
            let missing: Vec<String> = wait
                .correlation_ids
                .iter()
                .filter(|id| !wait.responses.contains_key(*id))
                .cloned()
                .collect();
            for id in missing {
                wait.responses.insert(id, NotifyResponseData::TimedOut);
            }
            Resumption {
                wait_id: wait_id.to_string(),
                instance_id: wait.instance_id.clone(),
                responses: std::mem::take(&mut wait.responses),
                timed_out: true,
            }
        };

        self.retire(wait_id);
        info!("Wait {} of instance {} timed out", wait_id, resumption.instance_id);
        (self.sink)(resumption);
        true
    }

    /// Expires `wait_id` after `timeout` unless it resolves first.
    pub fn schedule_timeout(self: &Arc<Self>, wait_id: String, timeout: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.expire(&wait_id);
        })
    }

    /// Delivers `data` to `correlation_id` after `delay`.
    pub fn schedule_notify(
        self: &Arc<Self>,
        correlation_id: String,
        data: NotifyResponseData,
        delay: Duration,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.notify(&correlation_id, data);
        })
    }

    /// Drops every outstanding wait of an instance without resuming it.
    ///
    /// Returns the number of waits cancelled.
    pub fn cancel_instance(&self, instance_id: &str) -> usize {
        let Some((_, wait_ids)) = self.by_instance.remove(instance_id) else {
            return 0;
        };

        let mut cancelled = 0;
        for wait_id in wait_ids {
            let Some(entry) = self.waits.get(&wait_id).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            {
                let mut wait = lock(&entry);
                if wait.resolved {
                    continue;
                }
                wait.resolved = true;
            }
            self.retire(&wait_id);
            cancelled += 1;
        }
        if cancelled > 0 {
            debug!("Cancelled {} wait(s) of instance {}", cancelled, instance_id);
        }
        cancelled
    }

    /// Removes a resolved wait and tombstones its ids.
    fn retire(&self, wait_id: &str) {
        let Some((_, entry)) = self.waits.remove(wait_id) else {
            return;
        };
        let (instance_id, correlation_ids) = {
            let wait = lock(&entry);
            (wait.instance_id.clone(), wait.correlation_ids.clone())
        };

        let now = Utc::now();
        for correlation_id in correlation_ids {
            self.tombstones.insert(correlation_id.clone(), now);
            self.by_correlation
                .remove_if(&correlation_id, |_, owner| owner == wait_id);
        }
        if let Some(mut waits) = self.by_instance.get_mut(&instance_id) {
            waits.retain(|id| id != wait_id);
        }
        self.by_instance.remove_if(&instance_id, |_, waits| waits.is_empty());
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.by_correlation.contains_key(correlation_id)
    }

    pub fn is_resolved(&self, correlation_id: &str) -> bool {
        self.tombstones.contains_key(correlation_id)
    }

    /// Number of outstanding waits.
    pub fn pending_waits(&self) -> usize {
        self.waits.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Forgets resolved ids older than `retention`.
    ///
    /// A late notification for a pruned id is reported as `Unknown`.
    /// Returns the number of ids forgotten.
    pub fn prune_tombstones(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let before = self.tombstones.len();
        self.tombstones.retain(|_, resolved_at| {
            match now.signed_duration_since(*resolved_at).to_std() {
                Ok(age) => age < retention,
                Err(_) => true,
            }
        });
        let pruned = before.saturating_sub(self.tombstones.len());
        if pruned > 0 {
            debug!("Pruned {} resolved correlation id(s)", pruned);
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_single_wait_resumes_once() {
        let (registry, mut rx) = NotifyRegistry::channel();
        registry.register_wait("inst-1", ids(&["cb-1"])).unwrap();

        assert_eq!(registry.notify("cb-1", NotifyResponseData::step_success()), NotifyOutcome::Resumed);
        assert_eq!(
            registry.notify("cb-1", NotifyResponseData::step_success()),
            NotifyOutcome::AlreadyResolved
        );

        let resumption = rx.try_recv().unwrap();
        assert_eq!(resumption.instance_id, "inst-1");
        assert!(!resumption.timed_out);
        assert!(rx.try_recv().is_err());
        assert!(registry.is_resolved("cb-1"));
        assert_eq!(registry.pending_waits(), 0);
    }

    #[test]
    fn test_fan_in_waits_for_all_ids() {
        let (registry, mut rx) = NotifyRegistry::channel();
        registry.register_wait("parent", ids(&["a", "b", "c"])).unwrap();

        assert_eq!(registry.notify("b", NotifyResponseData::step_success()), NotifyOutcome::Recorded);
        assert_eq!(registry.notify("b", NotifyResponseData::step_success()), NotifyOutcome::AlreadyResolved);
        assert_eq!(registry.notify("a", NotifyResponseData::step_failure("boom")), NotifyOutcome::Recorded);
        assert!(rx.try_recv().is_err());

        assert_eq!(registry.notify("c", NotifyResponseData::step_success()), NotifyOutcome::Resumed);
        let resumption = rx.try_recv().unwrap();
        assert_eq!(resumption.responses.len(), 3);
        assert_eq!(resumption.responses["a"].status(), Some(ExecutionStatus::Failed));
    }

    #[test]
    fn test_unknown_correlation_id() {
        let (registry, _rx) = NotifyRegistry::channel();
        assert_eq!(registry.notify("nobody", NotifyResponseData::step_success()), NotifyOutcome::Unknown);
    }

    #[test]
    fn test_correlation_id_awaited_once() {
        let (registry, _rx) = NotifyRegistry::channel();
        registry.register_wait("inst-1", ids(&["shared"])).unwrap();
        let err = registry.register_wait("inst-2", ids(&["other", "shared"])).unwrap_err();
        assert!(matches!(err, EngineError::Synchronization(_)));
        // the partially claimed id was released again
        assert!(!registry.is_pending("other"));
        assert!(registry.register_wait("inst-2", ids(&[])).is_err());
    }

    #[test]
    fn test_expire_fills_missing_responses() {
        let (registry, mut rx) = NotifyRegistry::channel();
        let wait_id = registry.register_wait("inst-1", ids(&["x", "y"])).unwrap();
        registry.notify("x", NotifyResponseData::step_success());

        assert!(registry.expire(&wait_id));
        assert!(!registry.expire(&wait_id));

        let resumption = rx.try_recv().unwrap();
        assert!(resumption.timed_out);
        assert_eq!(resumption.responses["x"], NotifyResponseData::step_success());
        assert_eq!(resumption.responses["y"], NotifyResponseData::TimedOut);
        assert_eq!(registry.notify("y", NotifyResponseData::step_success()), NotifyOutcome::AlreadyResolved);
    }

    #[test]
    fn test_cancel_instance_tombstones_ids() {
        let (registry, mut rx) = NotifyRegistry::channel();
        registry.register_wait("inst-1", ids(&["cb-123"])).unwrap();
        assert_eq!(registry.cancel_instance("inst-1"), 1);
        assert_eq!(registry.cancel_instance("inst-1"), 0);

        assert_eq!(
            registry.notify("cb-123", NotifyResponseData::step_success()),
            NotifyOutcome::AlreadyResolved
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_prune_forgets_old_tombstones_only() {
        let (registry, _rx) = NotifyRegistry::channel();
        registry.register_wait("inst-1", ids(&["old"])).unwrap();
        registry.notify("old", NotifyResponseData::step_success());
        assert_eq!(registry.tombstone_count(), 1);

        assert_eq!(registry.prune_tombstones(Duration::from_secs(3600)), 0);
        assert_eq!(registry.notify("old", NotifyResponseData::step_success()), NotifyOutcome::AlreadyResolved);

        assert_eq!(registry.prune_tombstones(Duration::ZERO), 1);
        assert_eq!(registry.tombstone_count(), 0);
        assert_eq!(registry.notify("old", NotifyResponseData::step_success()), NotifyOutcome::Unknown);
    }

    #[test]
    fn test_approval_and_rejection_statuses() {
        assert_eq!(NotifyResponseData::approve("ops").status(), Some(ExecutionStatus::Success));
        assert_eq!(
            NotifyResponseData::reject("ops", "change freeze").status(),
            Some(ExecutionStatus::Rejected)
        );
        let rejected = NotifyResponseData::PermitRejected {
            resource: "cluster-x".to_string(),
            message: "too large".to_string(),
        };
        assert_eq!(rejected.status(), Some(ExecutionStatus::Failed));

        let parsed: NotifyResponseData =
            serde_json::from_str(r#"{"type":"APPROVAL","approved":false,"comments":"no"}"#).unwrap();
        assert_eq!(parsed.status(), Some(ExecutionStatus::Rejected));
    }

    #[tokio::test]
    async fn test_scheduled_timeout_resumes_with_timed_out() {
        let (registry, mut rx) = NotifyRegistry::channel();
        let registry = Arc::new(registry);
        let wait_id = registry.register_wait("inst-1", ids(&["slow"])).unwrap();
        registry.schedule_timeout(wait_id, Duration::from_millis(20));

        let resumption = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(resumption.timed_out);
        assert_eq!(resumption.responses["slow"], NotifyResponseData::TimedOut);
    }

    #[tokio::test]
    async fn test_concurrent_notifications_resume_exactly_once() {
        let (registry, mut rx) = NotifyRegistry::channel();
        let registry = Arc::new(registry);
        registry.register_wait("inst-1", ids(&["dup"])).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.notify("dup", NotifyResponseData::step_success())
            }));
        }
        let mut resumed = 0;
        for handle in handles {
            if handle.await.unwrap() == NotifyOutcome::Resumed {
                resumed += 1;
            }
        }
        assert_eq!(resumed, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
