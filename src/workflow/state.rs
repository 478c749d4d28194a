//! Execution State Persistence
//!
//! Every record the engine produces is written through a [`StateStore`]
//! so a restarted process can reload and resume in-flight executions.
//! Writes are atomic per entity.
//!
//! Two stores are provided:
//!
//! - [`MemoryStore`]: keyed maps, for tests and embedded use
//! - [`JsonFileStore`]: one pretty-printed JSON file per entity under a
//!   state directory

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::instance::{StateExecutionInstance, WorkflowExecution};
use super::model::WorkflowDefinition;
use super::step_data::StepExecutionSummary;
use crate::context::ContextElement;
use crate::error::Result;
use crate::queue::QueuedEvent;
use crate::sync::{BarrierSnapshot, ConstraintSnapshot};

/// A context element with the instance that pushed it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredElement {
    pub execution_id: String,
    pub owner_instance_id: String,
    pub element: ContextElement,
}

/// Persistence boundary of the engine.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()>;
    async fn load_execution(&self, id: &str) -> Result<Option<WorkflowExecution>>;
    async fn load_executions(&self) -> Result<Vec<WorkflowExecution>>;

    /// The definition an execution runs, kept so it can be resumed.
    async fn save_definition(&self, execution_id: &str, definition: &WorkflowDefinition) -> Result<()>;
    async fn load_definition(&self, execution_id: &str) -> Result<Option<WorkflowDefinition>>;

    async fn save_element(&self, element: &StoredElement) -> Result<()>;
    async fn elements_for_execution(&self, execution_id: &str) -> Result<Vec<StoredElement>>;

    async fn save_instance(&self, instance: &StateExecutionInstance) -> Result<()>;
    async fn load_instance(&self, id: &str) -> Result<Option<StateExecutionInstance>>;
    async fn instances_for_execution(&self, execution_id: &str) -> Result<Vec<StateExecutionInstance>>;

    async fn save_barrier(&self, barrier: &BarrierSnapshot) -> Result<()>;
    async fn barriers_for_execution(&self, execution_id: &str) -> Result<Vec<BarrierSnapshot>>;
    async fn save_constraint(&self, constraint: &ConstraintSnapshot) -> Result<()>;
    async fn save_event(&self, event: &QueuedEvent) -> Result<()>;
    async fn load_events(&self) -> Result<Vec<QueuedEvent>>;

    /// Writes a step summary once. Returns false if one already exists
    /// for the instance.
    async fn record_summary(&self, summary: &StepExecutionSummary) -> Result<bool>;
    async fn summaries_for_execution(&self, execution_id: &str) -> Result<Vec<StepExecutionSummary>>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    executions: DashMap<String, WorkflowExecution>,
    definitions: DashMap<String, WorkflowDefinition>,
    elements: DashMap<String, StoredElement>,
    instances: DashMap<String, StateExecutionInstance>,
    barriers: DashMap<(String, String), BarrierSnapshot>,
    constraints: DashMap<String, ConstraintSnapshot>,
    events: DashMap<String, QueuedEvent>,
    summaries: DashMap<String, StepExecutionSummary>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn barrier(&self, execution_id: &str, key: &str) -> Option<BarrierSnapshot> {
        self.barriers
            .get(&(execution_id.to_string(), key.to_string()))
            .map(|b| b.clone())
    }

    pub fn constraint(&self, name: &str) -> Option<ConstraintSnapshot> {
        self.constraints.get(name).map(|c| c.clone())
    }

    pub fn event(&self, id: &str) -> Option<QueuedEvent> {
        self.events.get(id).map(|e| e.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        self.executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    async fn load_executions(&self) -> Result<Vec<WorkflowExecution>> {
        let mut executions: Vec<_> = self.executions.iter().map(|e| e.clone()).collect();
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn save_definition(&self, execution_id: &str, definition: &WorkflowDefinition) -> Result<()> {
        self.definitions.insert(execution_id.to_string(), definition.clone());
        Ok(())
    }

    async fn load_definition(&self, execution_id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.definitions.get(execution_id).map(|d| d.clone()))
    }

    async fn save_element(&self, element: &StoredElement) -> Result<()> {
        self.elements.insert(element.element.id.clone(), element.clone());
        Ok(())
    }

    async fn elements_for_execution(&self, execution_id: &str) -> Result<Vec<StoredElement>> {
        Ok(self
            .elements
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .map(|e| e.clone())
            .collect())
    }

    async fn save_instance(&self, instance: &StateExecutionInstance) -> Result<()> {
        self.instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: &str) -> Result<Option<StateExecutionInstance>> {
        Ok(self.instances.get(id).map(|i| i.clone()))
    }

    async fn instances_for_execution(&self, execution_id: &str) -> Result<Vec<StateExecutionInstance>> {
        let mut instances: Vec<_> = self
            .instances
            .iter()
            .filter(|i| i.execution_id == execution_id)
            .map(|i| i.clone())
            .collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn save_barrier(&self, barrier: &BarrierSnapshot) -> Result<()> {
        self.barriers.insert(
            (barrier.execution_id.clone(), barrier.key.clone()),
            barrier.clone(),
        );
        Ok(())
    }

    async fn barriers_for_execution(&self, execution_id: &str) -> Result<Vec<BarrierSnapshot>> {
        Ok(self
            .barriers
            .iter()
            .filter(|b| b.execution_id == execution_id)
            .map(|b| b.clone())
            .collect())
    }

    async fn save_constraint(&self, constraint: &ConstraintSnapshot) -> Result<()> {
        self.constraints.insert(constraint.name.clone(), constraint.clone());
        Ok(())
    }

    async fn save_event(&self, event: &QueuedEvent) -> Result<()> {
        self.events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn load_events(&self) -> Result<Vec<QueuedEvent>> {
        let mut events: Vec<_> = self.events.iter().map(|e| e.clone()).collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn record_summary(&self, summary: &StepExecutionSummary) -> Result<bool> {
        match self.summaries.entry(summary.instance_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(summary.clone());
                Ok(true)
            }
        }
    }

    async fn summaries_for_execution(&self, execution_id: &str) -> Result<Vec<StepExecutionSummary>> {
        let mut summaries: Vec<_> = self
            .summaries
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .map(|s| s.clone())
            .collect();
        summaries.sort_by_key(|s| s.ended_at);
        Ok(summaries)
    }
}

/// File-backed store.
///
/// Layout under the state directory:
///
/// ```text
/// executions/{execution}.json
/// definitions/{execution}.json
/// elements/{execution}/{element}.json
/// index/{instance}.json
/// instances/{execution}/{instance}.json
/// barriers/{execution}/{key}.json
/// constraints/{name}.json
/// events/{event}.json
/// summaries/{execution}/{instance}.json
/// ```
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, parts: &[&str]) -> PathBuf {
        let mut path = self.root.clone();
        let (file, dirs) = match parts.split_last() {
            Some(split) => split,
            None => return path,
        };
        for dir in dirs {
            path.push(file_safe(dir));
        }
        path.push(format!("{}.json", file_safe(file)));
        path
    }

    async fn write<T: Serialize + Sync>(&self, path: PathBuf, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(value)?;
        // Rename over the target so readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    async fn read<T: DeserializeOwned + Send>(&self, path: PathBuf) -> Result<Option<T>> {
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_dir<T: DeserializeOwned + Send>(&self, dir: PathBuf) -> Result<Vec<T>> {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut values = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(value) = self.read(path).await? {
                values.push(value);
            }
        }
        Ok(values)
    }
}

/// Maps an id to something usable as a file name.
fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        self.write(self.path(&["executions", &execution.id]), execution).await
    }

    async fn load_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        self.read(self.path(&["executions", id])).await
    }

    async fn load_executions(&self) -> Result<Vec<WorkflowExecution>> {
        let mut executions: Vec<WorkflowExecution> = self.read_dir(self.root.join("executions")).await?;
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn save_definition(&self, execution_id: &str, definition: &WorkflowDefinition) -> Result<()> {
        self.write(self.path(&["definitions", execution_id]), definition).await
    }

    async fn load_definition(&self, execution_id: &str) -> Result<Option<WorkflowDefinition>> {
        self.read(self.path(&["definitions", execution_id])).await
    }

    async fn save_element(&self, element: &StoredElement) -> Result<()> {
        self.write(
            self.path(&["elements", &element.execution_id, &element.element.id]),
            element,
        )
        .await
    }

    async fn elements_for_execution(&self, execution_id: &str) -> Result<Vec<StoredElement>> {
        self.read_dir(self.root.join("elements").join(file_safe(execution_id))).await
    }

    async fn save_instance(&self, instance: &StateExecutionInstance) -> Result<()> {
        // Index by id so load_instance needs no execution id.
        self.write(self.path(&["index", &instance.id]), &instance.execution_id).await?;
        self.write(
            self.path(&["instances", &instance.execution_id, &instance.id]),
            instance,
        )
        .await
    }

    async fn load_instance(&self, id: &str) -> Result<Option<StateExecutionInstance>> {
        let execution_id: Option<String> = self.read(self.path(&["index", id])).await?;
        match execution_id {
            Some(execution_id) => self.read(self.path(&["instances", &execution_id, id])).await,
            None => Ok(None),
        }
    }

    async fn instances_for_execution(&self, execution_id: &str) -> Result<Vec<StateExecutionInstance>> {
        let mut instances: Vec<StateExecutionInstance> =
            self.read_dir(self.root.join("instances").join(file_safe(execution_id))).await?;
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn save_barrier(&self, barrier: &BarrierSnapshot) -> Result<()> {
        self.write(self.path(&["barriers", &barrier.execution_id, &barrier.key]), barrier)
            .await
    }

    async fn barriers_for_execution(&self, execution_id: &str) -> Result<Vec<BarrierSnapshot>> {
        self.read_dir(self.root.join("barriers").join(file_safe(execution_id))).await
    }

    async fn save_constraint(&self, constraint: &ConstraintSnapshot) -> Result<()> {
        self.write(self.path(&["constraints", &constraint.name]), constraint).await
    }

    async fn save_event(&self, event: &QueuedEvent) -> Result<()> {
        self.write(self.path(&["events", &event.id]), event).await
    }

    async fn load_events(&self) -> Result<Vec<QueuedEvent>> {
        let mut events: Vec<QueuedEvent> = self.read_dir(self.root.join("events")).await?;
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn record_summary(&self, summary: &StepExecutionSummary) -> Result<bool> {
        let path = self.path(&["summaries", &summary.execution_id, &summary.instance_id]);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(summary)?;
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Summary for {} already recorded", summary.instance_id);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;
        info!("Recorded summary for '{}' ({})", summary.state_name, summary.status);
        Ok(true)
    }

    async fn summaries_for_execution(&self, execution_id: &str) -> Result<Vec<StepExecutionSummary>> {
        let mut summaries: Vec<StepExecutionSummary> =
            self.read_dir(self.root.join("summaries").join(file_safe(execution_id))).await?;
        summaries.sort_by_key(|s| s.ended_at);
        Ok(summaries)
    }
}

/// Builds the store named by an optional state directory.
pub fn store_for(state_dir: Option<&Path>) -> Box<dyn StateStore> {
    match state_dir {
        Some(dir) => {
            info!("Persisting execution state to {}", dir.display());
            Box::new(JsonFileStore::new(dir))
        }
        None => Box::new(MemoryStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextElementKind;
    use crate::queue::{DeploymentEvent, EventKind};
    use crate::sync::{BarrierState, QueueStrategy};
    use crate::workflow::model::{MachinePath, State, StateMachine};
    use crate::workflow::status::ExecutionStatus;
    use crate::workflow::step_data::{StepExecutionData, StepKind};
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::tempdir;

    fn finished_instance(execution_id: &str) -> StateExecutionInstance {
        let state = State::step("deploy", StepKind::Command);
        let mut instance = StateExecutionInstance::new(execution_id, &state, MachinePath::root());
        instance.advance(ExecutionStatus::Running);
        instance.advance(ExecutionStatus::Success);
        instance.step_data = Some(StepExecutionData::Command {
            command_name: "deploy.sh".to_string(),
            exit_code: Some(0),
            output: None,
        });
        instance
    }

    async fn exercise_store(store: &dyn StateStore) {
        let instance = finished_instance("exec-1");
        let execution = WorkflowExecution::new("deploy", &instance.id, "exec-1");
        store.save_execution(&execution).await.unwrap();
        store.save_instance(&instance).await.unwrap();
        store.save_instance(&finished_instance("exec-2")).await.unwrap();

        assert_eq!(store.load_execution("exec-1").await.unwrap(), Some(execution.clone()));
        assert_eq!(store.load_executions().await.unwrap(), vec![execution]);
        assert_eq!(store.load_instance(&instance.id).await.unwrap(), Some(instance.clone()));
        assert!(store.load_instance("missing").await.unwrap().is_none());
        assert_eq!(store.instances_for_execution("exec-1").await.unwrap().len(), 1);

        let definition = WorkflowDefinition::new(
            "deploy",
            StateMachine::new("main").with_state(State::step("deploy", StepKind::Command)),
        );
        store.save_definition("exec-1", &definition).await.unwrap();
        assert_eq!(store.load_definition("exec-1").await.unwrap(), Some(definition));
        assert!(store.load_definition("exec-2").await.unwrap().is_none());

        let element = StoredElement {
            execution_id: "exec-1".to_string(),
            owner_instance_id: instance.id.clone(),
            element: ContextElement::new(ContextElementKind::Standard, "vars").with_value("region", "eu-west-1"),
        };
        store.save_element(&element).await.unwrap();
        assert_eq!(store.elements_for_execution("exec-1").await.unwrap(), vec![element]);
        assert!(store.elements_for_execution("exec-2").await.unwrap().is_empty());

        let event = QueuedEvent::new(DeploymentEvent::new(EventKind::Deployment, "exec-1"), 0, Utc::now());
        store.save_event(&event).await.unwrap();
        assert_eq!(store.load_events().await.unwrap(), vec![event]);

        let summary = StepExecutionSummary::from_instance(&instance).unwrap();
        assert!(store.record_summary(&summary).await.unwrap());
        assert!(!store.record_summary(&summary).await.unwrap());
        let summaries = store.summaries_for_execution("exec-1").await.unwrap();
        assert_eq!(summaries, vec![summary]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        exercise_store(&store).await;

        let barrier = BarrierSnapshot {
            execution_id: "exec-1".to_string(),
            key: "post-provision".to_string(),
            expected: BTreeSet::from(["a".to_string(), "b".to_string()]),
            arrivals: BTreeMap::from([("a".to_string(), ExecutionStatus::Success)]),
            state: BarrierState::Pending,
        };
        store.save_barrier(&barrier).await.unwrap();
        assert_eq!(store.barrier("exec-1", "post-provision"), Some(barrier.clone()));
        assert_eq!(store.barriers_for_execution("exec-1").await.unwrap(), vec![barrier]);
    }

    #[tokio::test]
    async fn test_json_file_store() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        exercise_store(&store).await;

        let constraint = ConstraintSnapshot {
            name: "cluster/X".to_string(),
            capacity: 1,
            strategy: QueueStrategy::Fifo,
            used: 1,
            holders: BTreeMap::from([("phase-1".to_string(), 1)]),
            queued: vec!["phase-2".to_string()],
        };
        store.save_constraint(&constraint).await.unwrap();
        assert!(dir.path().join("constraints").join("cluster_X.json").exists());

        let event = QueuedEvent::new(DeploymentEvent::new(EventKind::Deployment, "exec-1"), 0, Utc::now());
        store.save_event(&event).await.unwrap();
        assert!(dir.path().join("events").join(format!("{}.json", event.id)).exists());

        let barrier = BarrierSnapshot {
            execution_id: "exec-1".to_string(),
            key: "post:provision".to_string(),
            expected: BTreeSet::from(["a".to_string(), "b".to_string()]),
            arrivals: BTreeMap::new(),
            state: BarrierState::Pending,
        };
        store.save_barrier(&barrier).await.unwrap();
        assert_eq!(store.barriers_for_execution("exec-1").await.unwrap(), vec![barrier]);
    }

    #[tokio::test]
    async fn test_json_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let instance = finished_instance("exec-9");
        JsonFileStore::new(dir.path()).save_instance(&instance).await.unwrap();

        let reopened = store_for(Some(dir.path()));
        let loaded = reopened.instances_for_execution("exec-9").await.unwrap();
        assert_eq!(loaded, vec![instance]);
    }

    #[test]
    fn test_file_safe() {
        assert_eq!(file_safe("barrier:exec/1"), "barrier_exec_1");
        assert_eq!(file_safe("phase-a_1.0"), "phase-a_1.0");
    }
}
