//! Job supervisor
//!
//! A fixed-size worker pool draining a bounded queue of session
//! entry-point jobs. Supervision rules:
//!
//! - a job whose entrypoint returns `Ok(())` is `Completed`,
//! - a returned error (or a caught panic) marks it `Failed` with the
//!   error recorded; the pool itself keeps running,
//! - cooperative cancellation marks it `Cancelled` and is never reported
//!   as a failure,
//! - a saturated queue rejects `schedule` with `QueueFull` rather than
//!   blocking the caller.
//!
//! Shutdown broadcasts quit, waits up to a grace period for workers to
//! finish, then aborts whatever remains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// Default worker count.
pub const DEFAULT_WORKERS: usize = 5;

/// Default queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// How long shutdown waits before aborting workers.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Context handed to a running job.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    /// Tripped on supervisor shutdown or per-job cancellation.
    pub cancel: CancellationToken,
    /// Opaque payload the scheduler attached.
    pub user_data: Value,
}

/// Lifecycle of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Async entrypoint run on a worker.
pub type JobEntrypoint = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, Result<()>> + Send>;

/// A unit of work for the pool.
pub struct Job {
    pub id: String,
    pub user_data: Value,
    entrypoint: JobEntrypoint,
}

impl Job {
    pub fn new<F, Fut>(entrypoint: F) -> Self
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: format!("job_{}", Uuid::new_v4().simple()),
            user_data: Value::Null,
            entrypoint: Box::new(move |ctx| Box::pin(entrypoint(ctx))),
        }
    }

    pub fn with_user_data(mut self, data: Value) -> Self {
        self.user_data = data;
        self
    }
}

/// Status snapshot of one job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub status: JobStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Fixed worker pool over a bounded job queue.
pub struct JobSupervisor {
    queue_tx: mpsc::Sender<Job>,
    records: Arc<Mutex<HashMap<String, JobRecord>>>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl JobSupervisor {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_WORKERS, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_limits(workers: usize, queue_capacity: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<Job>(queue_capacity);
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let records: Arc<Mutex<HashMap<String, JobRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let queue_rx = queue_rx.clone();
                let records = records.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    debug!("job worker {} up", worker_id);
                    loop {
                        let job = {
                            let mut rx = queue_rx.lock().await;
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                job = rx.recv() => match job {
                                    Some(job) => job,
                                    None => break,
                                },
                            }
                        };
                        run_job(worker_id, job, &records, &cancel).await;
                    }
                    debug!("job worker {} down", worker_id);
                })
            })
            .collect();

        info!(
            "job supervisor up: {} workers, queue capacity {}",
            workers.max(1),
            queue_capacity
        );
        Self {
            queue_tx,
            records,
            cancel,
            workers: handles,
            queue_capacity,
        }
    }

    /// Enqueue a job. Fails with `QueueFull` when the queue is saturated;
    /// never blocks.
    pub fn schedule(&self, job: Job) -> Result<String> {
        let id = job.id.clone();
        self.records.lock().unwrap().insert(
            id.clone(),
            JobRecord {
                status: JobStatus::Pending,
                error: None,
                started_at: None,
            },
        );

        match self.queue_tx.try_send(job) {
            Ok(()) => Ok(id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.records.lock().unwrap().remove(&id);
                warn!("job queue full, rejecting {}", id);
                Err(AgentError::QueueFull {
                    capacity: self.queue_capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.records.lock().unwrap().remove(&id);
                Err(AgentError::NotStarted("job supervisor is shut down".into()))
            }
        }
    }

    /// Status of a job, if it was ever scheduled.
    pub fn status(&self, job_id: &str) -> Option<JobRecord> {
        self.records.lock().unwrap().get(job_id).cloned()
    }

    /// Supervisor-wide cancellation token; trips every running job.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Broadcast quit, wait for the grace period, abort stragglers.
    pub async fn shutdown(mut self) {
        info!("job supervisor shutting down");
        self.cancel.cancel();

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for handle in self.workers.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("job workers exceeded shutdown grace, aborting");
            for handle in &self.workers {
                handle.abort();
            }
        }
    }
}

impl Default for JobSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job(
    worker_id: usize,
    job: Job,
    records: &Arc<Mutex<HashMap<String, JobRecord>>>,
    cancel: &CancellationToken,
) {
    let job_id = job.id.clone();
    {
        let mut records = records.lock().unwrap();
        if let Some(record) = records.get_mut(&job_id) {
            record.status = JobStatus::Running;
            record.started_at = Some(Utc::now());
        }
    }
    debug!("worker {} running {}", worker_id, job_id);

    let ctx = JobContext {
        job_id: job_id.clone(),
        cancel: cancel.child_token(),
        user_data: job.user_data,
    };
    let job_cancel = ctx.cancel.clone();

    // The entrypoint runs on its own task so a panic is contained there
    // and lands here as a JoinError instead of killing the worker.
    let mut handle = tokio::spawn((job.entrypoint)(ctx));

    let (status, error) = tokio::select! {
        _ = job_cancel.cancelled() => {
            handle.abort();
            let _ = handle.await;
            (JobStatus::Cancelled, None)
        }
        joined = &mut handle => match joined {
            Ok(Ok(())) => (JobStatus::Completed, None),
            Ok(Err(e)) if e.is_cancelled() => (JobStatus::Cancelled, None),
            Ok(Err(e)) => {
                error!("job {} failed: {}", job_id, e);
                (JobStatus::Failed, Some(e.to_string()))
            }
            Err(join_err) => {
                let converted = AgentError::from_join(join_err);
                match converted {
                    AgentError::Cancelled => (JobStatus::Cancelled, None),
                    other => {
                        error!("job {} panicked: {}", job_id, other);
                        (JobStatus::Failed, Some(other.to_string()))
                    }
                }
            }
        },
    };

    let mut records = records.lock().unwrap();
    if let Some(record) = records.get_mut(&job_id) {
        record.status = status;
        record.error = error;
    }
}
