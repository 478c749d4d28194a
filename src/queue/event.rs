//! Deployment Events
//!
//! Events emitted by deploy steps when they mutate infrastructure, and the
//! durable queue record wrapping each one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Deployment,
    InstanceChange,
    ContainerDeployment,
}

/// "A deployment happened": input for inventory reconciliation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeploymentEvent {
    pub kind: EventKind,
    pub execution_id: String,
    #[serde(default)]
    pub state_instance_id: Option<String>,
    #[serde(default)]
    pub infra_mapping: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl DeploymentEvent {
    pub fn new(kind: EventKind, execution_id: impl Into<String>) -> Self {
        Self {
            kind,
            execution_id: execution_id.into(),
            state_instance_id: None,
            infra_mapping: None,
            service: None,
            details: Value::Null,
        }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.state_instance_id = Some(instance_id.into());
        self
    }

    pub fn with_infra_mapping(mut self, infra_mapping: impl Into<String>) -> Self {
        self.infra_mapping = Some(infra_mapping.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Ready,
    Leased,
    Acked,
    /// Out of retries; kept for manual inspection
    Parked,
}

/// Queue record around one event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub id: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Not leasable before this time
    pub earliest_get: DateTime<Utc>,
    /// Lease expiry of the current lease
    #[serde(default)]
    pub reset_timestamp: Option<DateTime<Utc>>,
    pub retries: u32,
    #[serde(default)]
    pub lease_owner: Option<String>,
    pub state: DeliveryState,
    #[serde(default)]
    pub last_error: Option<String>,
    pub event: DeploymentEvent,
}

impl QueuedEvent {
    pub fn new(event: DeploymentEvent, priority: i32, earliest_get: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority,
            created_at: Utc::now(),
            earliest_get,
            reset_timestamp: None,
            retries: 0,
            lease_owner: None,
            state: DeliveryState::Ready,
            last_error: None,
            event,
        }
    }

    /// A ready record past its not-before time, or a lease that expired.
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            DeliveryState::Ready => self.earliest_get <= now,
            DeliveryState::Leased => self.lease_expired(now),
            DeliveryState::Acked | DeliveryState::Parked => false,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == DeliveryState::Leased && self.reset_timestamp.map_or(true, |reset| reset <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_leasable_rules() {
        let now = Utc::now();
        let mut record = QueuedEvent::new(
            DeploymentEvent::new(EventKind::Deployment, "exec-1"),
            0,
            now + Duration::seconds(10),
        );
        assert!(!record.is_leasable(now));
        assert!(record.is_leasable(now + Duration::seconds(10)));

        record.state = DeliveryState::Leased;
        record.reset_timestamp = Some(now + Duration::seconds(30));
        assert!(!record.is_leasable(now + Duration::seconds(20)));
        assert!(record.is_leasable(now + Duration::seconds(30)));

        record.state = DeliveryState::Acked;
        assert!(!record.is_leasable(now + Duration::days(1)));
    }

    #[test]
    fn test_event_builder() {
        let event = DeploymentEvent::new(EventKind::ContainerDeployment, "exec-1")
            .with_service("web")
            .with_infra_mapping("east")
            .with_details(serde_json::json!({"pods": 3}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "CONTAINER_DEPLOYMENT");
        assert_eq!(json["details"]["pods"], 3);
    }
}
