//! Resource Constraints
//!
//! Named counting semaphores that bound how many consumers, across all
//! executions, may hold units of a shared deployment resource. Requests
//! that do not fit are queued and granted strictly in queue order as
//! units are released.
//!
//! Each resource is mutated under its own map entry; unrelated resources
//! never contend.

use std::collections::BTreeMap;

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Order in which queued requests are granted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStrategy {
    /// Arrival order
    #[default]
    Fifo,
    /// Higher priority first, arrival order within a priority
    Priority,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConstraintConfig {
    pub name: String,
    pub capacity: u32,
    #[serde(default)]
    pub strategy: QueueStrategy,
}

impl ConstraintConfig {
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            name: name.into(),
            capacity,
            strategy: QueueStrategy::Fifo,
        }
    }

    pub fn with_strategy(mut self, strategy: QueueStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Who is asking for units: a holding scope inside an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: String,
    pub execution_id: String,
}

impl Requester {
    pub fn new(id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            execution_id: execution_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    Queued { correlation_id: String },
}

/// A queued request that has just been granted; its correlation id must
/// be notified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub resource: String,
    pub requester_id: String,
    pub execution_id: String,
    pub units: u32,
    pub correlation_id: String,
}

/// A queued request dropped because it no longer fits the capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub resource: String,
    pub requester_id: String,
    pub execution_id: String,
    pub units: u32,
    pub message: String,
}

/// What registering or resizing a resource changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// Queued requests admitted by a larger capacity
    pub grants: Vec<Grant>,
    /// Queued requests larger than a smaller capacity
    pub rejected: Vec<Rejection>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConstraintSnapshot {
    pub name: String,
    pub capacity: u32,
    pub strategy: QueueStrategy,
    pub used: u32,
    /// requester id -> units
    pub holders: BTreeMap<String, u32>,
    /// requester ids in grant order
    pub queued: Vec<String>,
}

#[derive(Debug, Clone)]
struct Holding {
    execution_id: String,
    units: u32,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    requester: Requester,
    units: u32,
    priority: i32,
    seq: u64,
    correlation_id: String,
}

#[derive(Debug)]
struct ConstraintEntry {
    capacity: u32,
    strategy: QueueStrategy,
    holders: BTreeMap<String, Holding>,
    queue: Vec<PendingRequest>,
    next_seq: u64,
}

impl ConstraintEntry {
    fn new(config: &ConstraintConfig) -> Self {
        Self {
            capacity: config.capacity,
            strategy: config.strategy,
            holders: BTreeMap::new(),
            queue: Vec::new(),
            next_seq: 0,
        }
    }

    fn used(&self) -> u32 {
        self.holders.values().map(|h| h.units).sum()
    }

    fn enqueue(&mut self, request: PendingRequest) {
        self.queue.push(request);
        self.sort_queue();
    }

    fn sort_queue(&mut self) {
        match self.strategy {
            QueueStrategy::Fifo => self.queue.sort_by_key(|r| r.seq),
            QueueStrategy::Priority => self
                .queue
                .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))),
        }
    }

    /// Grants queued requests from the head while they fit.
    fn drain_grants(&mut self, resource: &str) -> Vec<Grant> {
        let mut grants = Vec::new();
        while let Some(head) = self.queue.first() {
            if self.used() + head.units > self.capacity {
                break;
            }
            let request = self.queue.remove(0);
            self.holders.insert(
                request.requester.id.clone(),
                Holding {
                    execution_id: request.requester.execution_id.clone(),
                    units: request.units,
                },
            );
            grants.push(Grant {
                resource: resource.to_string(),
                requester_id: request.requester.id,
                execution_id: request.requester.execution_id,
                units: request.units,
                correlation_id: request.correlation_id,
            });
        }
        grants
    }

    fn snapshot(&self, name: &str) -> ConstraintSnapshot {
        ConstraintSnapshot {
            name: name.to_string(),
            capacity: self.capacity,
            strategy: self.strategy,
            used: self.used(),
            holders: self
                .holders
                .iter()
                .map(|(id, h)| (id.clone(), h.units))
                .collect(),
            queued: self.queue.iter().map(|r| r.requester.id.clone()).collect(),
        }
    }
}

/// Correlation id of a queued request.
pub fn correlation_id(resource: &str, requester_id: &str) -> String {
    format!("constraint:{}:{}", resource, requester_id)
}

/// Correlation id one state instance waits on for its holder's grant.
///
/// Several instances of one holder can wait on the same queued request.
pub fn waiter_id(resource: &str, requester_id: &str, instance_id: &str) -> String {
    format!("{}:{}", correlation_id(resource, requester_id), instance_id)
}

#[derive(Default)]
pub struct ResourceConstraintRegistry {
    constraints: DashMap<String, ConstraintEntry>,
}

impl ResourceConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource, or updates capacity and strategy of an
    /// existing one while keeping its holders and queue.
    ///
    /// The capacity may not drop below the units already granted. Queued
    /// requests larger than a reduced capacity are dropped and reported.
    pub fn register(&self, config: &ConstraintConfig) -> Result<Registration> {
        if config.capacity == 0 {
            return Err(EngineError::Admission {
                resource: config.name.clone(),
                message: "capacity must be at least 1".to_string(),
            });
        }
        let mut entry = self
            .constraints
            .entry(config.name.clone())
            .or_insert_with(|| ConstraintEntry::new(config));
        let used = entry.used();
        if config.capacity < used {
            return Err(EngineError::Admission {
                resource: config.name.clone(),
                message: format!(
                    "capacity {} is below the {} unit(s) currently granted",
                    config.capacity, used
                ),
            });
        }

        entry.capacity = config.capacity;
        entry.strategy = config.strategy;
        entry.sort_queue();

        let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.queue)
            .into_iter()
            .partition(|r| r.units <= config.capacity);
        entry.queue = kept;
        let rejected: Vec<Rejection> = dropped
            .into_iter()
            .map(|r| {
                warn!(
                    "Dropped queued request of {} for {} unit(s) of '{}': capacity is now {}",
                    r.requester.id, r.units, config.name, config.capacity
                );
                Rejection {
                    resource: config.name.clone(),
                    requester_id: r.requester.id,
                    execution_id: r.requester.execution_id,
                    units: r.units,
                    message: format!("requested {} units but capacity is {}", r.units, config.capacity),
                }
            })
            .collect();

        info!(
            "Registered resource constraint '{}' (capacity {}, {:?})",
            config.name, config.capacity, config.strategy
        );
        // a capacity increase may admit queued requests
        let grants = entry.drain_grants(&config.name);
        Ok(Registration { grants, rejected })
    }

    pub fn capacity(&self, resource: &str) -> Option<u32> {
        self.constraints.get(resource).map(|e| e.capacity)
    }

    /// Requests `units` of `resource`.
    ///
    /// Requests larger than the capacity are rejected outright. A holder
    /// asking again is granted without taking more units; a requester
    /// already queued gets its existing correlation id back. New requests
    /// never overtake a non-empty queue.
    pub fn acquire(&self, resource: &str, requester: &Requester, units: u32, priority: i32) -> Result<AcquireOutcome> {
        let mut entry = self
            .constraints
            .get_mut(resource)
            .ok_or_else(|| EngineError::UnknownConstraint(resource.to_string()))?;

        if units == 0 || units > entry.capacity {
            return Err(EngineError::Admission {
                resource: resource.to_string(),
                message: format!("requested {} units but capacity is {}", units, entry.capacity),
            });
        }
        if entry.holders.contains_key(&requester.id) {
            return Ok(AcquireOutcome::Granted);
        }
        if let Some(pending) = entry.queue.iter().find(|r| r.requester.id == requester.id) {
            return Ok(AcquireOutcome::Queued {
                correlation_id: pending.correlation_id.clone(),
            });
        }

        if entry.queue.is_empty() && entry.used() + units <= entry.capacity {
            entry.holders.insert(
                requester.id.clone(),
                Holding {
                    execution_id: requester.execution_id.clone(),
                    units,
                },
            );
            debug!("Granted {} unit(s) of '{}' to {}", units, resource, requester.id);
            return Ok(AcquireOutcome::Granted);
        }

        let seq = entry.next_seq;
        entry.next_seq += 1;
        let correlation_id = correlation_id(resource, &requester.id);
        entry.enqueue(PendingRequest {
            requester: requester.clone(),
            units,
            priority,
            seq,
            correlation_id: correlation_id.clone(),
        });
        debug!(
            "Queued {} for {} unit(s) of '{}' ({} waiting)",
            requester.id,
            units,
            resource,
            entry.queue.len()
        );
        Ok(AcquireOutcome::Queued { correlation_id })
    }

    /// Releases whatever `requester_id` holds or has queued on `resource`
    /// and returns the requests granted as a result.
    pub fn release(&self, resource: &str, requester_id: &str) -> Result<Vec<Grant>> {
        let mut entry = self
            .constraints
            .get_mut(resource)
            .ok_or_else(|| EngineError::UnknownConstraint(resource.to_string()))?;

        let held = entry.holders.remove(requester_id).is_some();
        let before = entry.queue.len();
        entry.queue.retain(|r| r.requester.id != requester_id);
        if !held && entry.queue.len() == before {
            warn!("{} released '{}' without holding it", requester_id, resource);
        }
        let grants = entry.drain_grants(resource);
        if held {
            debug!("{} released '{}', granted {} queued request(s)", requester_id, resource, grants.len());
        }
        Ok(grants)
    }

    /// Releases every holding and queued request of an execution across all
    /// resources.
    pub fn release_execution(&self, execution_id: &str) -> Vec<Grant> {
        let mut grants = Vec::new();
        for mut entry in self.constraints.iter_mut() {
            let resource = entry.key().clone();
            let before = entry.holders.len() + entry.queue.len();
            entry.holders.retain(|_, h| h.execution_id != execution_id);
            entry.queue.retain(|r| r.requester.execution_id != execution_id);
            let dropped = before - (entry.holders.len() + entry.queue.len());
            if dropped > 0 {
                info!(
                    "Released {} holding(s) of '{}' for execution {}",
                    dropped, resource, execution_id
                );
                grants.extend(entry.drain_grants(&resource));
            }
        }
        grants
    }

    /// Re-establishes a holding that existed before a restart.
    ///
    /// Fails if the units no longer fit the capacity.
    pub fn restore_holding(&self, resource: &str, requester: &Requester, units: u32) -> Result<()> {
        let mut entry = self
            .constraints
            .get_mut(resource)
            .ok_or_else(|| EngineError::UnknownConstraint(resource.to_string()))?;
        if entry.holders.contains_key(&requester.id) {
            return Ok(());
        }
        if entry.used() + units > entry.capacity {
            return Err(EngineError::Admission {
                resource: resource.to_string(),
                message: format!(
                    "cannot restore {} unit(s) for {}: {} of {} in use",
                    units,
                    requester.id,
                    entry.used(),
                    entry.capacity
                ),
            });
        }
        entry.holders.insert(
            requester.id.clone(),
            Holding {
                execution_id: requester.execution_id.clone(),
                units,
            },
        );
        debug!("Restored {} unit(s) of '{}' held by {}", units, resource, requester.id);
        Ok(())
    }

    pub fn snapshot(&self, resource: &str) -> Option<ConstraintSnapshot> {
        self.constraints.get(resource).map(|e| e.snapshot(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(capacity: u32, strategy: QueueStrategy) -> ResourceConstraintRegistry {
        let registry = ResourceConstraintRegistry::new();
        registry
            .register(&ConstraintConfig::new("cluster-x", capacity).with_strategy(strategy))
            .unwrap();
        registry
    }

    fn req(id: &str) -> Requester {
        Requester::new(id, format!("exec-{}", id))
    }

    #[test]
    fn test_grant_then_queue_then_handoff() {
        let registry = registry(1, QueueStrategy::Fifo);
        assert_eq!(registry.acquire("cluster-x", &req("a"), 1, 0).unwrap(), AcquireOutcome::Granted);
        let queued = registry.acquire("cluster-x", &req("b"), 1, 0).unwrap();
        assert_eq!(
            queued,
            AcquireOutcome::Queued {
                correlation_id: "constraint:cluster-x:b".to_string()
            }
        );

        let grants = registry.release("cluster-x", "a").unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].requester_id, "b");
        assert_eq!(grants[0].correlation_id, "constraint:cluster-x:b");
        let snapshot = registry.snapshot("cluster-x").unwrap();
        assert_eq!(snapshot.used, 1);
        assert!(snapshot.queued.is_empty());
    }

    #[test]
    fn test_over_capacity_request_is_rejected() {
        let registry = registry(2, QueueStrategy::Fifo);
        let err = registry.acquire("cluster-x", &req("a"), 3, 0).unwrap_err();
        assert!(matches!(err, EngineError::Admission { .. }));
        assert!(registry.snapshot("cluster-x").unwrap().queued.is_empty());
        assert!(matches!(
            registry.acquire("nowhere", &req("a"), 1, 0),
            Err(EngineError::UnknownConstraint(_))
        ));
    }

    #[test]
    fn test_priority_ordering_with_fifo_ties() {
        let registry = registry(1, QueueStrategy::Priority);
        registry.acquire("cluster-x", &req("holder"), 1, 0).unwrap();
        registry.acquire("cluster-x", &req("low"), 1, 1).unwrap();
        registry.acquire("cluster-x", &req("high-1"), 1, 9).unwrap();
        registry.acquire("cluster-x", &req("high-2"), 1, 9).unwrap();

        let order = registry.snapshot("cluster-x").unwrap().queued;
        assert_eq!(order, vec!["high-1", "high-2", "low"]);

        let grants = registry.release("cluster-x", "holder").unwrap();
        assert_eq!(grants[0].requester_id, "high-1");
    }

    #[test]
    fn test_head_of_line_blocks_smaller_requests() {
        let registry = registry(3, QueueStrategy::Fifo);
        registry.acquire("cluster-x", &req("a"), 2, 0).unwrap();
        // b needs 2, only 1 free: queued
        assert!(matches!(
            registry.acquire("cluster-x", &req("b"), 2, 0).unwrap(),
            AcquireOutcome::Queued { .. }
        ));
        // c would fit but may not overtake b
        assert!(matches!(
            registry.acquire("cluster-x", &req("c"), 1, 0).unwrap(),
            AcquireOutcome::Queued { .. }
        ));

        let grants = registry.release("cluster-x", "a").unwrap();
        let granted: Vec<_> = grants.iter().map(|g| g.requester_id.as_str()).collect();
        assert_eq!(granted, vec!["b", "c"]);
        assert_eq!(registry.snapshot("cluster-x").unwrap().used, 3);
    }

    #[test]
    fn test_reacquire_is_idempotent() {
        let registry = registry(2, QueueStrategy::Fifo);
        registry.acquire("cluster-x", &req("a"), 1, 0).unwrap();
        registry.acquire("cluster-x", &req("a"), 1, 0).unwrap();
        assert_eq!(registry.snapshot("cluster-x").unwrap().used, 1);
    }

    #[test]
    fn test_release_execution_frees_units() {
        let registry = registry(1, QueueStrategy::Fifo);
        registry.acquire("cluster-x", &Requester::new("phase-1", "exec-1"), 1, 0).unwrap();
        registry.acquire("cluster-x", &Requester::new("phase-2", "exec-2"), 1, 0).unwrap();
        registry.acquire("cluster-x", &Requester::new("phase-3", "exec-1"), 1, 0).unwrap();

        let grants = registry.release_execution("exec-1");
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].execution_id, "exec-2");
        let snapshot = registry.snapshot("cluster-x").unwrap();
        assert_eq!(snapshot.holders.keys().collect::<Vec<_>>(), vec!["phase-2"]);
        assert!(snapshot.queued.is_empty());
    }

    #[test]
    fn test_capacity_never_exceeded_under_mixed_operations() {
        let registry = registry(3, QueueStrategy::Priority);
        let mut holders: Vec<String> = Vec::new();
        // deterministic pseudo-random walk over acquire/release calls
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for step in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let id = format!("r{}", step);
            if seed % 3 == 0 && !holders.is_empty() {
                let victim = holders.remove((seed as usize / 3) % holders.len());
                for grant in registry.release("cluster-x", &victim).unwrap() {
                    holders.push(grant.requester_id);
                }
            } else {
                let units = (seed % 3) as u32 + 1;
                let priority = (seed % 5) as i32;
                if registry.acquire("cluster-x", &req(&id), units, priority).unwrap() == AcquireOutcome::Granted {
                    holders.push(req(&id).id);
                }
            }
            let snapshot = registry.snapshot("cluster-x").unwrap();
            assert!(snapshot.used <= snapshot.capacity, "over capacity at step {}", step);
        }
    }

    #[test]
    fn test_capacity_increase_admits_queue() {
        let registry = registry(1, QueueStrategy::Fifo);
        registry.acquire("cluster-x", &req("a"), 1, 0).unwrap();
        registry.acquire("cluster-x", &req("b"), 1, 0).unwrap();
        let registration = registry.register(&ConstraintConfig::new("cluster-x", 2)).unwrap();
        assert_eq!(registration.grants.len(), 1);
        assert_eq!(registration.grants[0].requester_id, "b");
        assert!(registration.rejected.is_empty());
    }

    #[test]
    fn test_shrink_below_granted_units_is_refused() {
        let registry = registry(3, QueueStrategy::Fifo);
        registry.acquire("cluster-x", &req("a"), 3, 0).unwrap();

        let err = registry.register(&ConstraintConfig::new("cluster-x", 1)).unwrap_err();
        assert!(matches!(err, EngineError::Admission { .. }));
        let snapshot = registry.snapshot("cluster-x").unwrap();
        assert_eq!(snapshot.capacity, 3);
        assert_eq!(snapshot.used, 3);

        registry.release("cluster-x", "a").unwrap();
        registry.register(&ConstraintConfig::new("cluster-x", 1)).unwrap();
        assert_eq!(registry.capacity("cluster-x"), Some(1));
        assert!(registry.register(&ConstraintConfig::new("cluster-x", 0)).is_err());
    }

    #[test]
    fn test_shrink_drops_queued_requests_that_no_longer_fit() {
        let registry = registry(4, QueueStrategy::Fifo);
        registry.acquire("cluster-x", &req("a"), 2, 0).unwrap();
        // b needs 3 with 2 free: queued at the head, c behind it
        registry.acquire("cluster-x", &req("b"), 3, 0).unwrap();
        registry.acquire("cluster-x", &req("c"), 1, 0).unwrap();

        let registration = registry.register(&ConstraintConfig::new("cluster-x", 2)).unwrap();
        assert_eq!(registration.rejected.len(), 1);
        assert_eq!(registration.rejected[0].requester_id, "b");
        assert!(registration.grants.is_empty());
        assert_eq!(registry.snapshot("cluster-x").unwrap().queued, vec!["c"]);

        // with b gone, c is next in line
        let grants = registry.release("cluster-x", "a").unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].requester_id, "c");
        let snapshot = registry.snapshot("cluster-x").unwrap();
        assert!(snapshot.used <= snapshot.capacity);
    }

    #[test]
    fn test_restore_holding_respects_capacity() {
        let registry = registry(2, QueueStrategy::Fifo);
        registry.restore_holding("cluster-x", &req("a"), 2).unwrap();
        registry.restore_holding("cluster-x", &req("a"), 2).unwrap();
        assert_eq!(registry.snapshot("cluster-x").unwrap().used, 2);
        assert!(matches!(
            registry.restore_holding("cluster-x", &req("b"), 1),
            Err(EngineError::Admission { .. })
        ));
        assert!(matches!(
            registry.acquire("cluster-x", &req("b"), 1, 0).unwrap(),
            AcquireOutcome::Queued { .. }
        ));
    }
}
