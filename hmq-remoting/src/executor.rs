//! Bounded worker pool for request processors and callbacks.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// A unit of work submitted to a pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default queue capacity per pool.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// A job the pool refused, handed back to the caller.
pub struct Rejected(pub Job);

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rejected(..)")
    }
}

/// Fixed number of workers fed by a bounded queue.
///
/// Jobs are synchronous and run on the blocking thread pool, so at most
/// `workers` jobs execute at once. A full queue rejects new work.
pub struct WorkerPool {
    name: String,
    workers: usize,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl WorkerPool {
    /// Creates the pool and spawns its workers. Must be called within a Tokio runtime.
    pub fn new(name: impl Into<String>, workers: usize, queue_capacity: usize) -> Arc<Self> {
        let name = name.into();
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for index in 0..workers {
            let receiver = receiver.clone();
            let worker_name = format!("{}_{}", name, index + 1);
            tokio::spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    let Some(job) = job else {
                        break;
                    };
                    if let Err(e) = tokio::task::spawn_blocking(job).await {
                        if e.is_panic() {
                            tracing::error!("Job on {} panicked", worker_name);
                        }
                    }
                }
                tracing::debug!("Worker {} stopped", worker_name);
            });
        }

        Arc::new(Self {
            name,
            workers,
            sender: Mutex::new(Some(sender)),
        })
    }

    /// Submits a job, handing it back if the queue is full or the pool is shut down.
    pub fn execute(&self, job: Job) -> Result<(), Rejected> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(Rejected(job));
        };
        sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(job) | TrySendError::Closed(job) => Rejected(job),
        })
    }

    /// Stops accepting work. Queued jobs still run.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            tracing::debug!("Worker pool {} shut down", self.name);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Free slots in the queue.
    pub fn remaining_capacity(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|s| s.capacity())
            .unwrap_or(0)
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .finish()
    }
}
