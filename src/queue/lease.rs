//! Lease-Based Event Queue
//!
//! At-least-once delivery with a visibility timeout. Leasing an event sets
//! its `reset_timestamp`; an event that is not acked by then becomes
//! leasable again by any worker, with its retry counter bumped. After
//! `max_retries` re-deliveries the event is parked instead.
//!
//! Each record is claimed under its own map entry with a re-check of the
//! lease condition, so two workers can never hold the same live lease.
//!
//! Every change to a record is journaled until [`EventQueue::persist_changes`]
//! writes it through a state store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use log::{debug, error, info, warn};

use super::event::{DeliveryState, DeploymentEvent, QueuedEvent};
use crate::config::QueueConfig;
use crate::workflow::state::StateStore;

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

pub struct EventQueue {
    records: DashMap<String, QueuedEvent>,
    /// ids changed since the last persist
    changed: DashSet<String>,
    visibility_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl EventQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            records: DashMap::new(),
            changed: DashSet::new(),
            visibility_timeout: config.visibility_timeout(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
        }
    }

    pub fn enqueue(&self, event: DeploymentEvent) -> String {
        self.enqueue_with(event, 0, Utc::now())
    }

    pub fn enqueue_with(&self, event: DeploymentEvent, priority: i32, earliest_get: DateTime<Utc>) -> String {
        let record = QueuedEvent::new(event, priority, earliest_get);
        let id = record.id.clone();
        debug!("Enqueued {:?} event {} for execution {}", record.event.kind, id, record.event.execution_id);
        self.records.insert(id.clone(), record);
        self.changed.insert(id.clone());
        id
    }

    /// Re-inserts records loaded from durable storage.
    ///
    /// A lease held when the records were saved stays valid until its
    /// reset timestamp, then the event is redelivered.
    pub fn restore(&self, records: Vec<QueuedEvent>) -> usize {
        let mut restored = 0;
        for record in records {
            if record.state == DeliveryState::Acked {
                continue;
            }
            self.records.insert(record.id.clone(), record);
            restored += 1;
        }
        if restored > 0 {
            info!("Restored {} queued event(s)", restored);
        }
        restored
    }

    pub fn lease(&self, worker_id: &str) -> Option<QueuedEvent> {
        self.lease_at(worker_id, Utc::now())
    }

    /// Leases the best leasable event as of `now`: highest priority first,
    /// then oldest.
    pub fn lease_at(&self, worker_id: &str, now: DateTime<Utc>) -> Option<QueuedEvent> {
        let mut candidates: Vec<(i32, DateTime<Utc>, String)> = self
            .records
            .iter()
            .filter(|record| record.is_leasable(now))
            .map(|record| (record.priority, record.created_at, record.id.clone()))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, _, id) in candidates {
            let Some(mut record) = self.records.get_mut(&id) else {
                continue;
            };
            // another worker may have claimed it since the scan
            if !record.is_leasable(now) {
                continue;
            }
            if record.state == DeliveryState::Leased {
                record.retries += 1;
                warn!(
                    "Lease of event {} held by {:?} expired (retry {})",
                    record.id, record.lease_owner, record.retries
                );
                if record.retries > self.max_retries {
                    park(&mut record, "lease expired too many times");
                    self.changed.insert(id);
                    continue;
                }
            }
            self.changed.insert(id);
            record.state = DeliveryState::Leased;
            record.lease_owner = Some(worker_id.to_string());
            record.reset_timestamp = Some(now + to_chrono(self.visibility_timeout));
            debug!("Worker {} leased event {}", worker_id, record.id);
            return Some(record.clone());
        }
        None
    }

    pub fn ack(&self, id: &str, worker_id: &str) -> bool {
        self.ack_at(id, worker_id, Utc::now())
    }

    /// Acknowledges an event leased by `worker_id`; it is never leased
    /// again.
    ///
    /// Only a live lease can be acked. An ack for an unleased event, an
    /// expired lease or another worker's lease is ignored and returns
    /// false.
    pub fn ack_at(&self, id: &str, worker_id: &str, now: DateTime<Utc>) -> bool {
        let Some(mut record) = self.records.get_mut(id) else {
            warn!("{} acked unknown event {}", worker_id, id);
            return false;
        };
        if record.state != DeliveryState::Leased {
            warn!("{} acked event {} which is {:?}, not leased", worker_id, id, record.state);
            return false;
        }
        if record.lease_owner.as_deref() != Some(worker_id) {
            warn!(
                "{} acked event {} leased by {:?}; ignoring",
                worker_id, id, record.lease_owner
            );
            return false;
        }
        if record.reset_timestamp.map(|reset| reset <= now).unwrap_or(false) {
            warn!("{} acked event {} after its lease expired; ignoring", worker_id, id);
            return false;
        }
        record.state = DeliveryState::Acked;
        record.lease_owner = None;
        record.reset_timestamp = None;
        self.changed.insert(id.to_string());
        true
    }

    pub fn nack(&self, id: &str, error: &str) -> Option<DeliveryState> {
        self.nack_at(id, error, Utc::now())
    }

    /// Returns a leased event for a later retry, or parks it when its
    /// retries are used up.
    pub fn nack_at(&self, id: &str, error: &str, now: DateTime<Utc>) -> Option<DeliveryState> {
        let mut record = self.records.get_mut(id)?;
        if record.state != DeliveryState::Leased {
            return Some(record.state);
        }
        record.retries += 1;
        record.last_error = Some(error.to_string());
        record.lease_owner = None;
        record.reset_timestamp = None;
        if record.retries > self.max_retries {
            park(&mut record, error);
        } else {
            record.state = DeliveryState::Ready;
            record.earliest_get = now + to_chrono(self.retry_backoff);
        }
        self.changed.insert(id.to_string());
        Some(record.state)
    }

    /// Moves a parked event back to the ready state with a fresh budget.
    pub fn requeue_parked(&self, id: &str) -> bool {
        let Some(mut record) = self.records.get_mut(id) else {
            return false;
        };
        if record.state != DeliveryState::Parked {
            return false;
        }
        record.state = DeliveryState::Ready;
        record.retries = 0;
        record.earliest_get = Utc::now();
        self.changed.insert(id.to_string());
        info!("Requeued parked event {}", id);
        true
    }

    /// Takes the records changed since the last call.
    pub fn drain_changes(&self) -> Vec<QueuedEvent> {
        let ids: Vec<String> = self.changed.iter().map(|id| id.key().clone()).collect();
        let mut records: Vec<QueuedEvent> = ids
            .into_iter()
            .filter_map(|id| {
                self.changed.remove(&id);
                self.get(&id)
            })
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Writes every changed record through `store`. Records that fail to
    /// save are journaled again for the next call.
    pub async fn persist_changes(&self, store: &dyn StateStore) -> usize {
        let mut saved = 0;
        for record in self.drain_changes() {
            match store.save_event(&record).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    error!("Failed to persist event {}: {}", record.id, e);
                    self.changed.insert(record.id);
                }
            }
        }
        saved
    }

    pub fn get(&self, id: &str) -> Option<QueuedEvent> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn parked(&self) -> Vec<QueuedEvent> {
        self.in_state(DeliveryState::Parked)
    }

    pub fn in_state(&self, state: DeliveryState) -> Vec<QueuedEvent> {
        let mut records: Vec<QueuedEvent> = self
            .records
            .iter()
            .filter(|r| r.state == state)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Events not yet acked or parked.
    pub fn outstanding(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.state, DeliveryState::Ready | DeliveryState::Leased))
            .count()
    }

    /// Drops acked records; returns how many were removed.
    pub fn purge_acked(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.state != DeliveryState::Acked);
        before - self.records.len()
    }
}

fn park(record: &mut QueuedEvent, reason: &str) {
    record.state = DeliveryState::Parked;
    record.lease_owner = None;
    record.reset_timestamp = None;
    record.last_error = Some(reason.to_string());
    warn!(
        "Parked event {} for execution {} after {} retries: {}",
        record.id, record.event.execution_id, record.retries, reason
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::event::EventKind;
    use crate::workflow::state::MemoryStore;

    fn queue(max_retries: u32) -> EventQueue {
        EventQueue::new(&QueueConfig {
            visibility_timeout_secs: 60,
            max_retries,
            poll_interval_ms: 10,
            retry_backoff_secs: 5,
            workers: 2,
        })
    }

    fn event(execution: &str) -> DeploymentEvent {
        DeploymentEvent::new(EventKind::Deployment, execution)
    }

    #[test]
    fn test_expired_lease_is_redelivered_to_another_worker() {
        let queue = queue(3);
        let id = queue.enqueue(event("exec-1"));
        let now = Utc::now();

        let leased = queue.lease_at("worker-1", now).unwrap();
        assert_eq!(leased.id, id);
        assert!(queue.lease_at("worker-2", now + chrono::Duration::seconds(30)).is_none());

        let released = queue.lease_at("worker-2", now + chrono::Duration::seconds(61)).unwrap();
        assert_eq!(released.id, id);
        assert_eq!(released.retries, 1);
        assert_eq!(released.lease_owner.as_deref(), Some("worker-2"));
    }

    #[test]
    fn test_acked_event_is_never_leased_again() {
        let queue = queue(3);
        let id = queue.enqueue(event("exec-1"));
        let now = Utc::now();
        queue.lease_at("worker-1", now).unwrap();
        assert!(queue.ack_at(&id, "worker-1", now));
        assert!(!queue.ack_at(&id, "worker-1", now));
        assert!(queue.lease_at("worker-2", now + chrono::Duration::days(1)).is_none());
        assert_eq!(queue.outstanding(), 0);
        assert_eq!(queue.purge_acked(), 1);
    }

    #[test]
    fn test_ack_requires_a_live_lease_of_the_caller() {
        let queue = queue(3);
        let id = queue.enqueue(event("exec-1"));
        let now = Utc::now();

        // never leased
        assert!(!queue.ack_at(&id, "worker-1", now));
        assert_eq!(queue.get(&id).unwrap().state, DeliveryState::Ready);

        queue.lease_at("worker-1", now).unwrap();
        assert!(!queue.ack_at(&id, "worker-2", now));
        // the lease ran out before the ack arrived
        assert!(!queue.ack_at(&id, "worker-1", now + chrono::Duration::seconds(61)));
        assert_eq!(queue.get(&id).unwrap().state, DeliveryState::Leased);

        let redelivered = queue.lease_at("worker-2", now + chrono::Duration::seconds(61)).unwrap();
        assert!(!queue.ack_at(&id, "worker-1", now + chrono::Duration::seconds(62)));
        assert!(queue.ack_at(&redelivered.id, "worker-2", now + chrono::Duration::seconds(62)));
        assert_eq!(queue.get(&id).unwrap().state, DeliveryState::Acked);
        assert!(!queue.ack_at("missing", "worker-2", now));
    }

    #[tokio::test]
    async fn test_changes_are_persisted_and_restored() {
        let store = MemoryStore::new();
        let events = queue(3);
        let now = Utc::now();
        let acked = events.enqueue_with(event("exec-1"), 10, now);
        let leased = events.enqueue_with(event("exec-2"), 0, now);
        assert_eq!(events.persist_changes(&store).await, 2);
        assert_eq!(events.persist_changes(&store).await, 0);

        assert_eq!(events.lease_at("w1", now).unwrap().id, acked);
        assert_eq!(events.lease_at("w2", now).unwrap().id, leased);
        assert!(events.ack_at(&acked, "w1", now));
        assert_eq!(events.persist_changes(&store).await, 2);
        assert_eq!(store.event(&acked).unwrap().state, DeliveryState::Acked);
        assert_eq!(store.event(&leased).unwrap().lease_owner.as_deref(), Some("w2"));

        let reloaded = queue(3);
        assert_eq!(reloaded.restore(store.load_events().await.unwrap()), 1);
        assert!(reloaded.get(&acked).is_none());
        // the restored lease is redelivered once it expires
        assert!(reloaded.lease_at("w3", now).is_none());
        let again = reloaded.lease_at("w3", now + chrono::Duration::seconds(61)).unwrap();
        assert_eq!(again.id, leased);
        assert_eq!(again.retries, 1);
    }

    #[test]
    fn test_priority_then_age_ordering() {
        let queue = queue(3);
        let now = Utc::now();
        let low = queue.enqueue_with(event("low"), 0, now);
        let high = queue.enqueue_with(event("high"), 10, now);

        let later = now + chrono::Duration::seconds(1);
        assert_eq!(queue.lease_at("w", later).unwrap().id, high);
        assert_eq!(queue.lease_at("w", later).unwrap().id, low);
        assert!(queue.lease_at("w", later).is_none());
    }

    #[test]
    fn test_parked_after_bounded_redeliveries() {
        let queue = queue(1);
        let id = queue.enqueue(event("exec-1"));
        let mut now = Utc::now();

        queue.lease_at("w1", now).unwrap();
        now = now + chrono::Duration::seconds(61);
        let second = queue.lease_at("w2", now).unwrap();
        assert_eq!(second.retries, 1);
        now = now + chrono::Duration::seconds(61);
        assert!(queue.lease_at("w3", now).is_none());

        let parked = queue.parked();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id, id);
        assert!(queue.requeue_parked(&id));
        assert_eq!(queue.get(&id).unwrap().state, DeliveryState::Ready);
    }

    #[test]
    fn test_nack_applies_backoff() {
        let queue = queue(2);
        let id = queue.enqueue(event("exec-1"));
        let now = Utc::now();
        queue.lease_at("w1", now).unwrap();

        assert_eq!(queue.nack_at(&id, "inventory offline", now), Some(DeliveryState::Ready));
        assert!(queue.lease_at("w1", now + chrono::Duration::seconds(1)).is_none());
        let again = queue.lease_at("w1", now + chrono::Duration::seconds(5)).unwrap();
        assert_eq!(again.retries, 1);
        assert_eq!(again.last_error.as_deref(), Some("inventory offline"));

        queue.nack_at(&id, "still offline", now);
        queue.lease_at("w1", now + chrono::Duration::seconds(10)).unwrap();
        assert_eq!(queue.nack_at(&id, "gone", now), Some(DeliveryState::Parked));
    }
}
