//! Asynchronous session-mutation queue with a fixed worker pool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    DeltaSync,
    SnapshotSync,
    StatusUpdate,
}

/// One queued unit of session mutation. Consumed exactly once, or dropped
/// at enqueue time when the queue is full.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub session_id: String,
    pub operation: SyncOperation,
    pub payload: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn new(session_id: String, operation: SyncOperation, payload: Map<String, Value>) -> Self {
        Self {
            session_id,
            operation,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queue_used: usize,
    pub dropped: u64,
}

/// Fixed pool of workers draining a bounded job queue. Queued mutations are
/// fire-and-forget: outcomes are logged, never surfaced to the enqueuer.
pub struct SyncWorkerPool {
    registry: Arc<SessionRegistry>,
    queue: mpsc::Sender<SyncJob>,
    // Keeps the queue open even when no worker task holds the receiver.
    receiver: Arc<Mutex<mpsc::Receiver<SyncJob>>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    dropped: AtomicU64,
    worker_count: usize,
    queue_capacity: usize,
}

impl SyncWorkerPool {
    pub fn new(registry: Arc<SessionRegistry>, config: &SyncConfig) -> Self {
        let (queue, rx) = mpsc::channel::<SyncJob>(config.queue_capacity);
        let (shutdown, _) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let registry = registry.clone();
            let rx = rx.clone();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                debug!(worker_id, "sync worker started");
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = shutdown_rx.changed() => None,
                            job = rx.recv() => job,
                        }
                    };
                    let Some(job) = job else {
                        break;
                    };
                    let result = apply_job(&registry, &job).await;
                    match &result {
                        Ok(()) => {
                            debug!(worker_id, session_id = %job.session_id, operation = ?job.operation, "sync job applied")
                        }
                        Err(err) => {
                            warn!(worker_id, session_id = %job.session_id, operation = ?job.operation, error = %err, "sync job failed")
                        }
                    }
                }
                debug!(worker_id, "sync worker shutting down");
            }));
        }
        info!(workers = config.workers, capacity = config.queue_capacity, "started sync workers");

        Self {
            registry,
            queue,
            receiver: rx,
            shutdown,
            handles: Mutex::new(handles),
            shutting_down: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            worker_count: config.workers,
            queue_capacity: config.queue_capacity,
        }
    }

    /// Non-blocking enqueue. A full queue drops the job; the drop is logged
    /// and counted, nothing is reported back to the caller.
    pub fn enqueue(&self, job: SyncJob) {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(session_id = %job.session_id, "sync pool shutting down, rejecting job");
            return;
        }
        match self.queue.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(session_id = %job.session_id, "sync queue full, dropping job");
            }
            Err(TrySendError::Closed(job)) => {
                warn!(session_id = %job.session_id, "sync queue closed, dropping job");
            }
        }
    }

    /// Optimistic-concurrency path for callers that need a definite answer.
    pub async fn atomic_sync(
        &self,
        session_id: &str,
        expected_version: u64,
        updates: Map<String, Value>,
    ) -> Result<()> {
        self.registry
            .compare_and_sync(session_id, expected_version, updates)
            .await
    }

    /// Process a list of jobs synchronously in the caller's flow of control,
    /// returning one result per job.
    pub async fn batch_sync(&self, jobs: &[SyncJob]) -> Vec<SyncResult> {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            let outcome = apply_job(&self.registry, job).await;
            results.push(SyncResult {
                success: outcome.is_ok(),
                session_id: job.session_id.clone(),
                error: outcome.err(),
                timestamp: Utc::now(),
            });
        }
        results
    }

    /// Stop accepting jobs, signal every worker, and wait for in-flight jobs
    /// to finish.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        self.receiver.lock().await.close();
        info!("sync workers stopped");
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            workers: self.worker_count,
            queue_capacity: self.queue_capacity,
            queue_used: self.queue_capacity - self.queue.capacity(),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Dispatch one job to the registry by operation kind.
async fn apply_job(registry: &SessionRegistry, job: &SyncJob) -> std::result::Result<(), String> {
    match job.operation {
        SyncOperation::DeltaSync => {
            let delta = job
                .payload
                .get("delta")
                .and_then(Value::as_object)
                .ok_or_else(|| "invalid delta payload".to_string())?;
            registry
                .sync(&job.session_id, Some(delta.clone()), None)
                .await
                .map_err(|e| e.to_string())
        }
        SyncOperation::SnapshotSync => {
            let snapshot = job
                .payload
                .get("snapshot")
                .and_then(Value::as_object)
                .ok_or_else(|| "invalid snapshot payload".to_string())?;
            registry
                .sync(&job.session_id, None, Some(snapshot.clone()))
                .await
                .map_err(|e| e.to_string())
        }
        SyncOperation::StatusUpdate => {
            let status = job
                .payload
                .get("status")
                .and_then(Value::as_str)
                .ok_or_else(|| "invalid status payload".to_string())?;
            registry
                .update_status(&job.session_id, status.to_string())
                .await
                .map_err(|e| e.to_string())
        }
    }
}
