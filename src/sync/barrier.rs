//! Barriers
//!
//! A barrier is keyed by (execution, key). Its expected participants are
//! defined when the execution starts; the barrier itself is created on the
//! first arrival. Participants block until every expected participant has
//! arrived, then all are released together. A released barrier is never
//! reused.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::workflow::status::ExecutionStatus;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierState {
    Pending,
    Released,
}

/// A participant blocked at a barrier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BarrierWaiter {
    pub participant: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrivalOutcome {
    /// Not everyone is here yet; wait on `correlation_id`
    Waiting { correlation_id: String },
    /// This arrival completed the barrier; `waiters` must be woken
    Released {
        arrivals: BTreeMap<String, ExecutionStatus>,
        waiters: Vec<BarrierWaiter>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BarrierSnapshot {
    pub execution_id: String,
    pub key: String,
    pub expected: BTreeSet<String>,
    pub arrivals: BTreeMap<String, ExecutionStatus>,
    pub state: BarrierState,
}

#[derive(Debug)]
struct BarrierEntry {
    expected: BTreeSet<String>,
    arrivals: BTreeMap<String, ExecutionStatus>,
    waiters: Vec<BarrierWaiter>,
    state: BarrierState,
}

type BarrierId = (String, String);

/// Correlation id a blocked participant waits on.
pub fn correlation_id(execution_id: &str, key: &str, participant: &str) -> String {
    format!("barrier:{}:{}:{}", execution_id, key, participant)
}

#[derive(Default)]
pub struct BarrierRegistry {
    definitions: DashMap<BarrierId, BTreeSet<String>>,
    barriers: DashMap<BarrierId, BarrierEntry>,
}

impl BarrierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a barrier for an execution.
    ///
    /// A barrier needs at least two participants, and a key cannot be
    /// defined twice within one execution.
    pub fn define(&self, execution_id: &str, key: &str, expected: BTreeSet<String>) -> Result<()> {
        if expected.len() < 2 {
            return Err(EngineError::Synchronization(format!(
                "barrier '{}' needs at least two participants, found {}",
                key,
                expected.len()
            )));
        }

        match self.definitions.entry((execution_id.to_string(), key.to_string())) {
            Entry::Occupied(_) => Err(EngineError::Synchronization(format!(
                "barrier '{}' is already defined for execution {}",
                key, execution_id
            ))),
            Entry::Vacant(slot) => {
                debug!("Defined barrier '{}' for {:?}", key, expected);
                slot.insert(expected);
                Ok(())
            }
        }
    }

    /// Records the arrival of `participant`.
    ///
    /// A participant that arrives twice gets its original correlation id
    /// back.
    pub fn arrive(
        &self,
        execution_id: &str,
        key: &str,
        participant: &str,
        status: ExecutionStatus,
    ) -> Result<ArrivalOutcome> {
        let id = (execution_id.to_string(), key.to_string());
        let expected = self
            .definitions
            .get(&id)
            .map(|expected| expected.value().clone())
            .ok_or_else(|| {
                EngineError::Synchronization(format!(
                    "barrier '{}' is not defined for execution {}",
                    key, execution_id
                ))
            })?;
        let mut entry = self.barriers.entry(id).or_insert_with(|| BarrierEntry {
            expected,
            arrivals: BTreeMap::new(),
            waiters: Vec::new(),
            state: BarrierState::Pending,
        });

        if entry.state == BarrierState::Released {
            return Err(EngineError::BarrierReleased(key.to_string()));
        }
        if !entry.expected.contains(participant) {
            return Err(EngineError::Synchronization(format!(
                "'{}' is not a participant of barrier '{}'",
                participant, key
            )));
        }
        if let Some(waiter) = entry.waiters.iter().find(|w| w.participant == participant) {
            return Ok(ArrivalOutcome::Waiting {
                correlation_id: waiter.correlation_id.clone(),
            });
        }

        entry.arrivals.insert(participant.to_string(), status);
        if entry.arrivals.len() < entry.expected.len() {
            let correlation_id = correlation_id(execution_id, key, participant);
            entry.waiters.push(BarrierWaiter {
                participant: participant.to_string(),
                correlation_id: correlation_id.clone(),
            });
            debug!(
                "'{}' arrived at barrier '{}' ({}/{})",
                participant,
                key,
                entry.arrivals.len(),
                entry.expected.len()
            );
            return Ok(ArrivalOutcome::Waiting { correlation_id });
        }

        entry.state = BarrierState::Released;
        let waiters = std::mem::take(&mut entry.waiters);
        info!("Barrier '{}' released for execution {}", key, execution_id);
        Ok(ArrivalOutcome::Released {
            arrivals: entry.arrivals.clone(),
            waiters,
        })
    }

    /// Pending barriers of an execution that still expect `participant`.
    pub fn pending_for(&self, execution_id: &str, participant: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .definitions
            .iter()
            .filter(|definition| definition.key().0 == execution_id && definition.value().contains(participant))
            .map(|definition| definition.key().clone())
            .collect::<Vec<_>>()
            .into_iter()
            .filter(|id| match self.barriers.get(id) {
                Some(entry) => entry.state == BarrierState::Pending && !entry.arrivals.contains_key(participant),
                None => true,
            })
            .map(|(_, key)| key)
            .collect();
        keys.sort();
        keys
    }

    /// Releases every pending barrier of an execution, returning the
    /// waiters that were blocked.
    pub fn force_release(&self, execution_id: &str) -> Vec<BarrierWaiter> {
        let mut released = Vec::new();
        for mut entry in self.barriers.iter_mut() {
            if entry.key().0 != execution_id || entry.state == BarrierState::Released {
                continue;
            }
            entry.state = BarrierState::Released;
            released.extend(std::mem::take(&mut entry.waiters));
        }
        if !released.is_empty() {
            info!(
                "Force-released {} barrier waiter(s) of execution {}",
                released.len(),
                execution_id
            );
        }
        released
    }

    /// Current view of a barrier; a defined barrier nobody reached yet is
    /// reported as pending with no arrivals.
    pub fn snapshot(&self, execution_id: &str, key: &str) -> Option<BarrierSnapshot> {
        let id = (execution_id.to_string(), key.to_string());
        if let Some(entry) = self.barriers.get(&id) {
            return Some(BarrierSnapshot {
                execution_id: execution_id.to_string(),
                key: key.to_string(),
                expected: entry.expected.clone(),
                arrivals: entry.arrivals.clone(),
                state: entry.state,
            });
        }
        self.definitions.get(&id).map(|expected| BarrierSnapshot {
            execution_id: execution_id.to_string(),
            key: key.to_string(),
            expected: expected.value().clone(),
            arrivals: BTreeMap::new(),
            state: BarrierState::Pending,
        })
    }

    /// Rebuilds a barrier from a saved snapshot.
    ///
    /// Every participant that already arrived at a pending barrier is
    /// treated as blocked on its correlation id again.
    pub fn restore(&self, snapshot: &BarrierSnapshot) {
        let id = (snapshot.execution_id.clone(), snapshot.key.clone());
        self.definitions
            .entry(id.clone())
            .or_insert_with(|| snapshot.expected.clone());
        if snapshot.arrivals.is_empty() && snapshot.state == BarrierState::Pending {
            return;
        }
        let waiters = match snapshot.state {
            BarrierState::Pending => snapshot
                .arrivals
                .keys()
                .map(|participant| BarrierWaiter {
                    participant: participant.clone(),
                    correlation_id: correlation_id(&snapshot.execution_id, &snapshot.key, participant),
                })
                .collect(),
            BarrierState::Released => Vec::new(),
        };
        debug!(
            "Restored barrier '{}' of execution {} ({}/{} arrived)",
            snapshot.key,
            snapshot.execution_id,
            snapshot.arrivals.len(),
            snapshot.expected.len()
        );
        self.barriers.insert(
            id,
            BarrierEntry {
                expected: snapshot.expected.clone(),
                arrivals: snapshot.arrivals.clone(),
                waiters,
                state: snapshot.state,
            },
        );
    }

    /// Drops all barriers of a finished execution.
    pub fn purge(&self, execution_id: &str) {
        self.definitions.retain(|(exec, _), _| exec != execution_id);
        self.barriers.retain(|(exec, _), _| exec != execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participants(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_release_only_when_all_arrive() {
        let barriers = BarrierRegistry::new();
        barriers
            .define("exec", "post-provision", participants(&["a", "b", "c"]))
            .unwrap();

        let first = barriers.arrive("exec", "post-provision", "a", ExecutionStatus::Success).unwrap();
        assert!(matches!(first, ArrivalOutcome::Waiting { .. }));
        let second = barriers.arrive("exec", "post-provision", "c", ExecutionStatus::Failed).unwrap();
        assert!(matches!(second, ArrivalOutcome::Waiting { .. }));
        assert_eq!(barriers.pending_for("exec", "b"), vec!["post-provision".to_string()]);

        match barriers.arrive("exec", "post-provision", "b", ExecutionStatus::Success).unwrap() {
            ArrivalOutcome::Released { arrivals, waiters } => {
                assert_eq!(arrivals.len(), 3);
                assert_eq!(arrivals["c"], ExecutionStatus::Failed);
                let woken: Vec<_> = waiters.iter().map(|w| w.participant.as_str()).collect();
                assert_eq!(woken, vec!["a", "c"]);
            }
            other => panic!("expected release, got {:?}", other),
        }
        assert!(barriers.pending_for("exec", "b").is_empty());
    }

    #[test]
    fn test_released_barrier_is_not_reused() {
        let barriers = BarrierRegistry::new();
        barriers.define("exec", "k", participants(&["a", "b"])).unwrap();
        barriers.arrive("exec", "k", "a", ExecutionStatus::Success).unwrap();
        barriers.arrive("exec", "k", "b", ExecutionStatus::Success).unwrap();

        let err = barriers.arrive("exec", "k", "a", ExecutionStatus::Success).unwrap_err();
        assert!(matches!(err, EngineError::BarrierReleased(_)));
        assert!(barriers.define("exec", "k", participants(&["a", "b"])).is_err());
    }

    #[test]
    fn test_repeated_arrival_is_idempotent() {
        let barriers = BarrierRegistry::new();
        barriers.define("exec", "k", participants(&["a", "b"])).unwrap();
        let first = barriers.arrive("exec", "k", "a", ExecutionStatus::Success).unwrap();
        let again = barriers.arrive("exec", "k", "a", ExecutionStatus::Success).unwrap();
        assert_eq!(first, again);
        assert_eq!(barriers.snapshot("exec", "k").unwrap().arrivals.len(), 1);
    }

    #[test]
    fn test_definition_rules() {
        let barriers = BarrierRegistry::new();
        assert!(barriers.define("exec", "solo", participants(&["a"])).is_err());
        barriers.define("exec", "k", participants(&["a", "b"])).unwrap();
        assert!(barriers.arrive("exec", "k", "z", ExecutionStatus::Success).is_err());
        assert!(barriers.arrive("exec", "missing", "a", ExecutionStatus::Success).is_err());
        // same key in another execution is a different barrier
        barriers.define("other", "k", participants(&["a", "b"])).unwrap();
    }

    #[test]
    fn test_force_release_and_purge() {
        let barriers = BarrierRegistry::new();
        barriers.define("exec", "k", participants(&["a", "b"])).unwrap();
        barriers.define("other", "k", participants(&["a", "b"])).unwrap();
        barriers.arrive("exec", "k", "a", ExecutionStatus::Success).unwrap();
        barriers.arrive("other", "k", "a", ExecutionStatus::Success).unwrap();

        let woken = barriers.force_release("exec");
        assert_eq!(woken.len(), 1);
        assert_eq!(barriers.snapshot("exec", "k").unwrap().state, BarrierState::Released);
        assert_eq!(barriers.snapshot("other", "k").unwrap().state, BarrierState::Pending);

        barriers.purge("exec");
        assert!(barriers.snapshot("exec", "k").is_none());
        assert!(barriers.snapshot("other", "k").is_some());
    }

    #[test]
    fn test_restore_resumes_counting_from_snapshot() {
        let barriers = BarrierRegistry::new();
        barriers.define("exec", "k", participants(&["a", "b", "c"])).unwrap();
        barriers.arrive("exec", "k", "a", ExecutionStatus::Success).unwrap();
        let saved = barriers.snapshot("exec", "k").unwrap();

        let restored = BarrierRegistry::new();
        restored.restore(&saved);
        assert_eq!(restored.snapshot("exec", "k"), Some(saved));
        assert_eq!(restored.pending_for("exec", "a"), Vec::<String>::new());

        restored.arrive("exec", "k", "b", ExecutionStatus::Success).unwrap();
        match restored.arrive("exec", "k", "c", ExecutionStatus::Success).unwrap() {
            ArrivalOutcome::Released { waiters, .. } => {
                let woken: Vec<_> = waiters.iter().map(|w| w.correlation_id.as_str()).collect();
                assert_eq!(woken, vec!["barrier:exec:k:a", "barrier:exec:k:b"]);
            }
            other => panic!("expected release, got {:?}", other),
        }
    }
}
