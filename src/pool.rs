//! Work queue pool.
//!
//! - Fixed set of workers hosted by an [`Executor`]
//! - Unbounded job queue in, unbounded result queue out
//! - Queued jobs and results can be purged when a batch goes stale
//! - One `None` sentinel per worker on shutdown, then every worker is joined

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::ExecutorError;
use crate::executor::{Executor, Task, WorkerChannels, WorkerExecutor, WorkerHandle};

/// Pool of workers running the same [`Task`].
pub struct WorkQueuePool<T: Task> {
    jobs_tx: Sender<Option<T::Job>>,
    jobs_rx: Receiver<Option<T::Job>>,
    results_rx: Receiver<T::Output>,
    workers: Vec<WorkerHandle>,
    shut_down: bool,
}

impl<T: Task> WorkQueuePool<T> {
    /// Start `workers` workers (at least one).
    ///
    /// Workers that did start are shut down again if a later one fails.
    pub fn new(executor: &Executor, workers: usize, params: T::Params) -> Result<Self, ExecutorError> {
        let num_workers = workers.max(1);
        let (jobs_tx, jobs_rx) = flume::unbounded();
        let (out_tx, results_rx) = flume::unbounded();

        let mut pool = Self {
            jobs_tx: jobs_tx.clone(),
            jobs_rx: jobs_rx.clone(),
            results_rx,
            workers: Vec::with_capacity(num_workers),
            shut_down: false,
        };

        let channels = WorkerChannels::<T> {
            jobs_tx,
            jobs_rx,
            out_tx,
        };
        for index in 0..num_workers {
            // `pool` is dropped (and shut down) on error
            let handle = executor.spawn(index, params.clone(), channels.clone())?;
            pool.workers.push(handle);
        }
        // Only workers hold result senders now, so `recv` fails once all are gone.
        drop(channels);

        debug!(pool = T::NAME, num_workers, executor = executor.describe(), "Started work queue pool");
        Ok(pool)
    }

    /// Queue a job. Returns false if the pool has shut down.
    pub fn submit(&self, job: T::Job) -> bool {
        !self.shut_down && self.jobs_tx.send(Some(job)).is_ok()
    }

    /// Result queue, for use with `flume::Selector` or blocking receives.
    pub fn results(&self) -> &Receiver<T::Output> {
        &self.results_rx
    }

    pub fn try_recv(&self) -> Result<T::Output, TryRecvError> {
        self.results_rx.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T::Output, RecvTimeoutError> {
        self.results_rx.recv_timeout(timeout)
    }

    /// Drop every queued job that no worker has picked up yet.
    ///
    /// Returns the number of jobs dropped. Sentinels are kept.
    pub fn purge_jobs(&self) -> usize {
        let mut purged = 0;
        let mut sentinels = 0;
        while let Ok(message) = self.jobs_rx.try_recv() {
            match message {
                Some(_) => purged += 1,
                None => sentinels += 1,
            }
        }
        for _ in 0..sentinels {
            let _ = self.jobs_tx.send(None);
        }
        if purged > 0 {
            trace!(pool = T::NAME, purged, "Purged queued jobs");
        }
        purged
    }

    /// Drop every result not yet received. Returns the number dropped.
    pub fn purge_results(&self) -> usize {
        self.results_rx.drain().count()
    }

    /// Number of jobs waiting for a worker.
    pub fn pending_jobs(&self) -> usize {
        self.jobs_rx.len()
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Number of workers still running.
    pub fn alive_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    /// Purge queued jobs, stop every worker and wait for them to exit.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        debug!(pool = T::NAME, "Shutting down work queue pool");

        self.purge_jobs();
        for _ in 0..self.workers.len() {
            let _ = self.jobs_tx.send(None);
        }
        for worker in self.workers.drain(..) {
            if !worker.is_alive() {
                warn!(worker = worker.name(), "Worker was already terminated");
            }
            worker.join();
        }
        self.purge_results();

        debug!(pool = T::NAME, "Work queue pool shutdown complete");
    }
}

impl<T: Task> Drop for WorkQueuePool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
