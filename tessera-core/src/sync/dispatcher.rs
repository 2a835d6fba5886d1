//! Background sync workers
//!
//! `SyncDispatcher` drains a bounded queue of write events; `spawn_periodic_sweep` runs
//! reconciliation sweeps on an interval until shutdown is signalled.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::orchestrator::{SweepOptions, SyncOrchestrator};
use super::{SyncAction, SyncTask};
use crate::error::ServiceError;

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

pub struct SyncDispatcher {
    sender: mpsc::Sender<SyncTask>,
    counters: Arc<Counters>,
    worker: JoinHandle<()>,
}

impl SyncDispatcher {
    /// Start the worker with a queue of `config().queue_capacity` tasks.
    pub fn spawn(orchestrator: Arc<SyncOrchestrator>) -> Self {
        let (sender, receiver) = mpsc::channel(orchestrator.config().queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_worker(orchestrator, receiver, counters.clone()));

        Self {
            sender,
            counters,
            worker,
        }
    }

    /// Queue `task`, waiting for space when the queue is full.
    pub async fn submit(&self, task: SyncTask) -> Result<(), ServiceError> {
        self.sender
            .send(task)
            .await
            .map_err(|_| {
                ServiceError::BackendUnavailable("sync dispatcher has stopped".to_string())
            })
    }

    /// Queue `task` without waiting; fails when the queue is full.
    pub fn try_submit(&self, task: SyncTask) -> Result<(), ServiceError> {
        self.sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => ServiceError::BackendUnavailable(format!(
                "sync queue full, dropped {}",
                task.canonical_id
            )),
            mpsc::error::TrySendError::Closed(_) => {
                ServiceError::BackendUnavailable("sync dispatcher has stopped".to_string())
            }
        })
    }

    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    /// Stop accepting tasks, drain the queue and wait for the worker.
    pub async fn shutdown(self) -> DispatcherStats {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            error!("Sync dispatcher worker panicked: {}", e);
        }
        self.counters.snapshot()
    }
}

impl Counters {
    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            processed: self.processed.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
        }
    }
}

async fn run_worker(
    orchestrator: Arc<SyncOrchestrator>,
    mut receiver: mpsc::Receiver<SyncTask>,
    counters: Arc<Counters>,
) {
    info!("Sync dispatcher started");

    while let Some(task) = receiver.recv().await {
        let retry = &orchestrator.config().retry;
        let mut attempt = 1;

        let result = loop {
            let result = match task.action {
                SyncAction::Upsert => orchestrator
                    .sync_entity(&task.canonical_id)
                    .await
                    .map(|_| ()),
                SyncAction::Remove => {
                    orchestrator
                        .remove_entity(&task.entity_type, &task.canonical_id)
                        .await
                }
            };

            match result {
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    counters.retried.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(retry.next_delay(attempt)).await;
                    attempt += 1;
                }
                other => break other,
            }
        };

        counters.processed.fetch_add(1, Ordering::SeqCst);
        match result {
            Ok(()) => {
                counters.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    entity_type = %task.entity_type,
                    canonical_id = %task.canonical_id,
                    "Sync task failed, left for the next sweep: {}",
                    e
                );
            }
        }
    }

    info!("Sync dispatcher stopped");
}

/// Run `sync_all` every `config().sweep_interval` until `shutdown` turns `true` or its sender
/// is dropped.
///
/// A sweep in progress stops between items when shutdown is signalled.
pub fn spawn_periodic_sweep(
    orchestrator: Arc<SyncOrchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = orchestrator.config().sweep_interval.max(Duration::from_millis(1));
        info!("Periodic sync sweep every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    let report = orchestrator
                        .sync_all_with(SweepOptions {
                            cancel: Some(shutdown.clone()),
                            ..SweepOptions::default()
                        })
                        .await;
                    if !report.failed.is_empty() {
                        warn!(
                            "Reconciliation sweep left {} record(s) unsynced",
                            report.failed.len()
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Periodic sync sweep stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRegistry;
    use crate::config::SyncConfig;
    use crate::retry::RetryPolicy;
    use crate::sync::memory::{MemoryCanonicalStore, MemoryMirrorStore};
    use crate::sync::{CanonicalRecord, CanonicalStore};
    use serde_json::json;

    fn orchestrator(
        canonical: Arc<MemoryCanonicalStore>,
        mirror: Arc<MemoryMirrorStore>,
    ) -> Arc<SyncOrchestrator> {
        let registry = CacheRegistry::in_memory("test:").unwrap();
        let config = SyncConfig {
            queue_capacity: 4,
            sweep_interval: Duration::from_secs(3600),
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2), 0.0),
            ..SyncConfig::default()
        };
        Arc::new(SyncOrchestrator::from_registry(&registry, canonical, vec![mirror], config))
    }

    #[tokio::test]
    async fn drains_queue_and_retries_transient_failures() {
        let canonical = Arc::new(MemoryCanonicalStore::new());
        let mirror = Arc::new(MemoryMirrorStore::new("relational"));
        for id in ["a", "b"] {
            canonical
                .upsert(CanonicalRecord::new(id, "content", format!("post-{}", id), json!({})))
                .await
                .unwrap();
        }
        canonical.fail_next_reads(1);

        let dispatcher = SyncDispatcher::spawn(orchestrator(canonical, mirror.clone()));
        dispatcher.submit(SyncTask::upsert("content", "a")).await.unwrap();
        dispatcher.submit(SyncTask::upsert("content", "b")).await.unwrap();
        dispatcher.submit(SyncTask::upsert("content", "missing")).await.unwrap();

        let stats = dispatcher.shutdown().await;
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(mirror.len(), 2);
    }

    #[tokio::test]
    async fn remove_tasks_clear_mirrors() {
        let canonical = Arc::new(MemoryCanonicalStore::new());
        let mirror = Arc::new(MemoryMirrorStore::new("relational"));
        canonical
            .upsert(CanonicalRecord::new("a", "content", "post-a", json!({})))
            .await
            .unwrap();
        let orchestrator = orchestrator(canonical.clone(), mirror.clone());
        orchestrator.sync_entity("a").await.unwrap();

        let dispatcher = SyncDispatcher::spawn(orchestrator);
        canonical.delete_by_id("a").await.unwrap();
        dispatcher.try_submit(SyncTask::remove("content", "a")).unwrap();

        let stats = dispatcher.shutdown().await;
        assert_eq!(stats.succeeded, 1);
        assert!(mirror.is_empty());
    }

    #[tokio::test]
    async fn periodic_sweep_stops_on_shutdown() {
        let canonical = Arc::new(MemoryCanonicalStore::new());
        let mirror = Arc::new(MemoryMirrorStore::new("relational"));
        canonical
            .upsert(CanonicalRecord::new("a", "user", "alice", json!({})))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);

        let handle = spawn_periodic_sweep(orchestrator(canonical, mirror.clone()), rx);
        // The first tick fires immediately.
        for _ in 0..50 {
            if mirror.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mirror.len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
