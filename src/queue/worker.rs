//! Reconciliation Workers
//!
//! A pool of tokio tasks leasing deployment events and handing them to an
//! inventory reconciler. Reconciliation failures only nack the event;
//! they never reach the deployment that produced it. Every lease, ack and
//! nack is written through the state store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::event::{DeliveryState, DeploymentEvent};
use super::lease::EventQueue;
use crate::workflow::state::StateStore;

/// Brings the instance inventory in line with live infrastructure.
#[async_trait]
pub trait InventoryReconciler: Send + Sync {
    async fn reconcile(&self, event: &DeploymentEvent) -> Result<(), String>;
}

pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks polling `queue`.
    pub fn spawn(
        queue: Arc<EventQueue>,
        reconciler: Arc<dyn InventoryReconciler>,
        store: Arc<dyn StateStore>,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|n| {
                let worker_id = format!("worker-{}", n);
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&queue),
                    Arc::clone(&reconciler),
                    Arc::clone(&store),
                    poll_interval,
                    signal.clone(),
                ))
            })
            .collect::<Vec<_>>();
        info!("Started {} reconciliation worker(s)", handles.len());
        Self { shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Signals every worker to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Reconciliation worker ended abnormally: {}", e);
            }
        }
        info!("Reconciliation workers stopped");
    }
}

async fn run_worker(
    worker_id: String,
    queue: Arc<EventQueue>,
    reconciler: Arc<dyn InventoryReconciler>,
    store: Arc<dyn StateStore>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let Some(record) = queue.lease(&worker_id) else {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };
        queue.persist_changes(store.as_ref()).await;

        match reconciler.reconcile(&record.event).await {
            Ok(()) => {
                if queue.ack(&record.id, &worker_id) {
                    debug!("{} reconciled event {}", worker_id, record.id);
                } else {
                    warn!("{} lost the lease of event {} before acking", worker_id, record.id);
                }
            }
            Err(e) => match queue.nack(&record.id, &e) {
                Some(DeliveryState::Parked) => {
                    warn!("{} gave up on event {}: {}", worker_id, record.id, e)
                }
                _ => debug!("{} will retry event {}: {}", worker_id, record.id, e),
            },
        }
        queue.persist_changes(store.as_ref()).await;
    }
    debug!("{} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::event::EventKind;
    use crate::workflow::state::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingReconciler {
        seen: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl InventoryReconciler for RecordingReconciler {
        async fn reconcile(&self, event: &DeploymentEvent) -> Result<(), String> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err("inventory service unavailable".to_string());
            }
            self.seen.lock().unwrap().push(event.execution_id.clone());
            Ok(())
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            visibility_timeout_secs: 60,
            max_retries: 3,
            poll_interval_ms: 5,
            retry_backoff_secs: 0,
            workers: 3,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let queue = Arc::new(EventQueue::new(&config()));
        for n in 0..10 {
            queue.enqueue(DeploymentEvent::new(EventKind::InstanceChange, format!("exec-{}", n)));
        }
        let reconciler = Arc::new(RecordingReconciler {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryStore::new());
        let pool = WorkerPool::spawn(
            queue.clone(),
            reconciler.clone(),
            store.clone(),
            3,
            Duration::from_millis(5),
        );
        assert_eq!(pool.size(), 3);

        wait_for(|| queue.outstanding() == 0).await;
        pool.shutdown().await;
        for record in queue.in_state(DeliveryState::Acked) {
            assert_eq!(store.event(&record.id).map(|e| e.state), Some(DeliveryState::Acked));
        }

        let mut seen = reconciler.seen.lock().unwrap().clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10);
        assert_eq!(queue.in_state(DeliveryState::Acked).len(), 10);
    }

    #[tokio::test]
    async fn test_failed_reconciliation_is_retried() {
        let queue = Arc::new(EventQueue::new(&config()));
        let id = queue.enqueue(DeploymentEvent::new(EventKind::Deployment, "exec-1"));
        let reconciler = Arc::new(RecordingReconciler {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(2),
        });
        let store = Arc::new(MemoryStore::new());
        let pool = WorkerPool::spawn(
            queue.clone(),
            reconciler.clone(),
            store.clone(),
            1,
            Duration::from_millis(5),
        );

        wait_for(|| store.event(&id).map(|r| r.state) == Some(DeliveryState::Acked)).await;
        pool.shutdown().await;

        assert_eq!(queue.get(&id).unwrap().retries, 2);
        assert_eq!(store.event(&id).unwrap().retries, 2);
        assert_eq!(reconciler.seen.lock().unwrap().len(), 1);
    }
}
