//! Job queue and worker pool
//!
//! Accepting a scan and executing it are separate steps: the trigger
//! endpoint enqueues a [`ScanJob`] once the scan is marked started, and
//! long-lived workers drain the queue. Callers follow progress through the
//! status endpoint.

use crate::error::{Result, VscannerError};
use crate::scanner::{ScanEngine, ScanRun};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// A started scan waiting for a worker. The scan id is the job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub scan_id: String,
    pub accepted_at: DateTime<Utc>,
}

impl ScanJob {
    pub fn new(scan_id: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
            accepted_at: Utc::now(),
        }
    }
}

/// Sending half of the job queue
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<ScanJob>,
}

impl JobQueue {
    /// Enqueues without waiting; a full or closed queue is an error
    pub fn submit(&self, job: ScanJob) -> Result<()> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => VscannerError::QueueError(format!(
                "Job queue is full, scan {} not queued",
                job.scan_id
            )),
            mpsc::error::TrySendError::Closed(job) => VscannerError::QueueError(format!(
                "Job queue is closed, scan {} not queued",
                job.scan_id
            )),
        })
    }
}

/// Workers draining the job queue
pub struct WorkerPool {
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Starts `workers` tasks sharing one bounded queue of `capacity` jobs.
    ///
    /// Workers stop taking jobs once `shutdown` flips to `true`; a scan in
    /// progress sees the same signal between items.
    pub fn spawn(
        engine: Arc<ScanEngine>,
        workers: usize,
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (JobQueue, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut set = JoinSet::new();
        for worker_id in 0..workers.max(1) {
            let engine = Arc::clone(&engine);
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.clone();
            set.spawn(async move {
                run_worker(worker_id, engine, rx, shutdown).await;
            });
        }
        info!("Started {} scan workers", workers.max(1));

        (JobQueue { tx }, Self { workers: set })
    }

    /// Waits for every worker to exit
    pub async fn join(mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!("Scan worker panicked: {e}");
            }
        }
    }
}

async fn next_job(
    rx: &Mutex<mpsc::Receiver<ScanJob>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<ScanJob> {
    if *shutdown.borrow() {
        return None;
    }
    let mut rx = rx.lock().await;
    tokio::select! {
        job = rx.recv() => job,
        _ = shutdown_requested(shutdown) => None,
    }
}

/// Resolves once the shutdown flag is set. A dropped sender never resolves.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn run_worker(
    worker_id: usize,
    engine: Arc<ScanEngine>,
    rx: Arc<Mutex<mpsc::Receiver<ScanJob>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Worker {worker_id} ready");
    while let Some(job) = next_job(&rx, &mut shutdown).await {
        let waited = Utc::now() - job.accepted_at;
        info!(
            "Worker {worker_id} picked up scan {} after {}ms",
            job.scan_id,
            waited.num_milliseconds()
        );
        match engine.execute(&job.scan_id, &shutdown).await {
            ScanRun::Completed(report) => info!(
                "Worker {worker_id} finished scan {}: {} found, {} passed, {} failed",
                report.scan_id, report.total_found, report.total_passed, report.total_failed
            ),
            ScanRun::Failed(message) => {
                error!("Worker {worker_id} scan {} failed: {message}", job.scan_id)
            }
        }
    }
    debug!("Worker {worker_id} stopped");
}
