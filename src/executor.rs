//! Worker executors.
//!
//! A [`Task`] is the stateful function a pool worker runs. The same task can be
//! hosted by a [`ThreadExecutor`] (one named thread per worker) or by a
//! [`ProcessExecutor`] (one child process per worker, JSON lines over
//! stdin/stdout). [`Executor`] is chosen once at startup and pools never
//! branch on which one is active.
//!
//! Job queues carry `Option<Job>`: `None` tells exactly one worker to exit.
//! A worker holds at most one job at a time. If it dies before finishing
//! that job, the job goes back on the shared queue for the other workers.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::error::ExecutorError;

/// Work run by a pool worker.
pub trait Task: Sized + 'static {
    /// Construction parameters, shipped to child processes as JSON.
    type Params: Serialize + DeserializeOwned + Clone + Send + 'static;
    /// Cloned while in flight, so a dead worker's job can be requeued.
    type Job: Serialize + DeserializeOwned + Clone + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Wire name used to select the task in a child process.
    const KIND: &'static str;
    /// Prefix of worker thread names.
    const NAME: &'static str;

    fn from_params(params: Self::Params, index: usize) -> anyhow::Result<Self>;

    /// Process one job. Any number of outputs may be emitted.
    ///
    /// Per-item failures must be turned into outputs, never panics.
    fn run(&mut self, job: Self::Job, emit: &mut dyn FnMut(Self::Output));
}

/// Queue endpoints handed to a worker.
pub struct WorkerChannels<T: Task> {
    /// Used to requeue the job of a worker that died.
    pub jobs_tx: Sender<Option<T::Job>>,
    pub jobs_rx: Receiver<Option<T::Job>>,
    pub out_tx: Sender<T::Output>,
}

impl<T: Task> Clone for WorkerChannels<T> {
    fn clone(&self) -> Self {
        Self {
            jobs_tx: self.jobs_tx.clone(),
            jobs_rx: self.jobs_rx.clone(),
            out_tx: self.out_tx.clone(),
        }
    }
}

/// Clears the liveness flag when the worker goes away, including on unwind.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The job a worker is running. Requeued if dropped before [`InFlight::done`].
struct InFlight<J> {
    job: Option<J>,
    requeue: Sender<Option<J>>,
}

impl<J> InFlight<J> {
    fn new(job: J, requeue: Sender<Option<J>>) -> Self {
        Self {
            job: Some(job),
            requeue,
        }
    }

    fn done(mut self) {
        self.job = None;
    }
}

impl<J> Drop for InFlight<J> {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            warn!("Worker died while running a job, requeueing it");
            let _ = self.requeue.send(Some(job));
        }
    }
}

/// Reply line written by a child process.
#[derive(Debug, Serialize, Deserialize)]
enum Reply<O> {
    Output(O),
    /// The current job is finished and the child is ready for the next one.
    Done,
}

/// Handle to one running worker.
pub struct WorkerHandle {
    name: String,
    alive: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker is still running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Wait for the worker to exit.
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                warn!(worker = %self.name, "Worker thread panicked");
            }
        }
    }
}

/// Something that can host pool workers.
pub trait WorkerExecutor {
    fn spawn<T: Task>(
        &self,
        index: usize,
        params: T::Params,
        channels: WorkerChannels<T>,
    ) -> Result<WorkerHandle, ExecutorError>;
}

fn worker_name<T: Task>(index: usize) -> String {
    format!("{}-{}", T::NAME, index)
}

/// Runs each worker on its own thread of the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadExecutor;

impl WorkerExecutor for ThreadExecutor {
    fn spawn<T: Task>(
        &self,
        index: usize,
        params: T::Params,
        channels: WorkerChannels<T>,
    ) -> Result<WorkerHandle, ExecutorError> {
        let name = worker_name::<T>(index);
        let alive = Arc::new(AtomicBool::new(true));
        let guard = AliveGuard(Arc::clone(&alive));

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = guard;
                let mut task = match T::from_params(params, index) {
                    Ok(task) => task,
                    Err(e) => {
                        error!(error = %e, "Failed to start worker");
                        return;
                    }
                };
                worker_loop(&mut task, &channels);
            })
            .map_err(|source| ExecutorError::Thread {
                name: name.clone(),
                source,
            })?;

        Ok(WorkerHandle {
            name,
            alive,
            threads: vec![handle],
        })
    }
}

/// Worker loop shared by in-process workers.
fn worker_loop<T: Task>(task: &mut T, channels: &WorkerChannels<T>) {
    debug!("Worker started");

    while let Ok(Some(job)) = channels.jobs_rx.recv() {
        // Requeues the job if `run` panics
        let in_flight = InFlight::new(job.clone(), channels.jobs_tx.clone());
        task.run(job, &mut |output| {
            // The pool may already be gone during shutdown
            let _ = channels.out_tx.send(output);
        });
        in_flight.done();
    }

    debug!("Worker stopped");
}

/// Runs each worker in a child process.
///
/// The child is `program args.. <kind> <index>`. It reads the task params from
/// the first stdin line, then one JSON job per line. For each job it writes
/// its outputs as `{"Output": ..}` lines followed by a `"Done"` line. The next
/// job is only written after `"Done"`, so a crash loses at most the job in
/// flight, and that one is requeued. Closing its stdin is the exit sentinel.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-run the current executable in worker mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, ["--worker"]))
    }
}

impl WorkerExecutor for ProcessExecutor {
    fn spawn<T: Task>(
        &self,
        index: usize,
        params: T::Params,
        channels: WorkerChannels<T>,
    ) -> Result<WorkerHandle, ExecutorError> {
        let name = worker_name::<T>(index);
        let params = serde_json::to_string(&params).map_err(|source| ExecutorError::Params {
            name: name.clone(),
            source,
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(T::KIND)
            .arg(index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ExecutorError::Process {
                name: name.clone(),
                source,
            })?;

        let missing_pipe = |name: &str| ExecutorError::Process {
            name: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "missing child pipe"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe(&name))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe(&name))?;

        let alive = Arc::new(AtomicBool::new(true));
        let guard = AliveGuard(Arc::clone(&alive));
        let in_flight: Arc<Mutex<Option<InFlight<T::Job>>>> = Arc::new(Mutex::new(None));
        // Disconnects when the reader sees the child exit
        let (done_tx, done_rx) = flume::bounded::<()>(1);

        let writer_channels = channels.clone();
        let writer_in_flight = Arc::clone(&in_flight);
        let writer = thread::Builder::new()
            .name(format!("{}-in", name))
            .spawn(move || {
                let mut stdin = BufWriter::new(stdin);
                if writeln!(stdin, "{}", params).and_then(|_| stdin.flush()).is_err() {
                    warn!("Worker process is not accepting parameters");
                    return;
                }

                enum Next<J> {
                    Job(J),
                    Stop,
                }

                loop {
                    // Waiting on `done_rx` too means a child that dies while
                    // idle never takes another job off the queue.
                    let next = flume::Selector::new()
                        .recv(&writer_channels.jobs_rx, |r| match r {
                            Ok(Some(job)) => Next::Job(job),
                            Ok(None) | Err(_) => Next::Stop,
                        })
                        .recv(&done_rx, |_| Next::Stop)
                        .wait();
                    let Next::Job(job) = next else { break };

                    let line = match serde_json::to_string(&job) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode job, dropping it");
                            continue;
                        }
                    };
                    *writer_in_flight.lock() =
                        Some(InFlight::new(job, writer_channels.jobs_tx.clone()));
                    if writeln!(stdin, "{}", line).and_then(|_| stdin.flush()).is_err() {
                        // Dropping the slot requeues the job
                        drop(writer_in_flight.lock().take());
                        break;
                    }
                    if done_rx.recv().is_err() {
                        break;
                    }
                }
                // Dropping stdin closes the pipe, which ends the child.
            })
            .map_err(|source| ExecutorError::Thread {
                name: name.clone(),
                source,
            })?;

        let out_tx = channels.out_tx;
        let reader = thread::Builder::new()
            .name(format!("{}-out", name))
            .spawn(move || {
                let _guard = guard;
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    match serde_json::from_str::<Reply<T::Output>>(&line) {
                        Ok(Reply::Output(output)) => {
                            let _ = out_tx.send(output);
                        }
                        Ok(Reply::Done) => {
                            if let Some(job) = in_flight.lock().take() {
                                job.done();
                            }
                            let _ = done_tx.send(());
                        }
                        Err(e) => trace!(error = %e, "Ignoring malformed worker output"),
                    }
                }

                match child.wait() {
                    Ok(status) if status.success() => debug!("Worker process exited"),
                    Ok(status) => warn!(%status, "Worker process exited abnormally"),
                    Err(e) => warn!(error = %e, "Failed to reap worker process"),
                }
                // Requeue whatever the child was working on before it counts as dead
                drop(in_flight.lock().take());
                drop(done_tx);
            })
            .map_err(|source| ExecutorError::Thread {
                name: name.clone(),
                source,
            })?;

        Ok(WorkerHandle {
            name,
            alive,
            threads: vec![writer, reader],
        })
    }
}

/// The executor selected for a session.
#[derive(Debug, Clone)]
pub enum Executor {
    Threads(ThreadExecutor),
    Processes(ProcessExecutor),
}

impl Executor {
    /// In-process workers.
    pub fn threads() -> Self {
        Self::Threads(ThreadExecutor)
    }

    /// Child-process workers when `multi` is enabled and the current
    /// executable can be located, threads otherwise.
    pub fn from_config(config: &Config) -> Self {
        if config.multi {
            match ProcessExecutor::current_exe() {
                Ok(executor) => return Self::Processes(executor),
                Err(e) => warn!(error = %e, "Multiprocessing unavailable, using threads"),
            }
        }
        Self::threads()
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Threads(_) => "threads",
            Self::Processes(_) => "processes",
        }
    }
}

impl WorkerExecutor for Executor {
    fn spawn<T: Task>(
        &self,
        index: usize,
        params: T::Params,
        channels: WorkerChannels<T>,
    ) -> Result<WorkerHandle, ExecutorError> {
        match self {
            Self::Threads(executor) => executor.spawn(index, params, channels),
            Self::Processes(executor) => executor.spawn(index, params, channels),
        }
    }
}

/// Child side of the process protocol: serve jobs from stdin until it closes.
pub fn serve<T: Task>(index: usize) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    let params = lines
        .next()
        .context("Missing worker parameters")?
        .context("Failed to read worker parameters")?;
    let params: T::Params =
        serde_json::from_str(&params).context("Failed to decode worker parameters")?;
    let mut task = T::from_params(params, index)?;

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    for line in lines {
        let line = line.context("Failed to read job")?;
        let job: T::Job = serde_json::from_str(&line).context("Failed to decode job")?;

        let mut failure = None;
        task.run(job, &mut |output| {
            if failure.is_none() {
                failure = write_reply(&mut out, &Reply::Output(output)).err();
            }
        });
        if let Some(e) = failure {
            return Err(e.context("Failed to write output"));
        }
        write_reply(&mut out, &Reply::<T::Output>::Done).context("Failed to report job done")?;
    }

    Ok(())
}

fn write_reply<O: Serialize>(out: &mut impl Write, reply: &Reply<O>) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, reply)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
