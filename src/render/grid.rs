//! Grid cell rendering.
//!
//! The grid render manager takes cell requests from the grid queue, renders
//! them on a [`WorkQueuePool`] and stores finished cells in the grid cache.
//! Each request is stamped with the current batch number. A result whose
//! batch is not the current one belongs to a grid that is no longer shown,
//! so it is dropped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{Canvas, CellSize, RenderParams, Rendered, Renderer, SizeMode, StyleParams};
use crate::executor::Task;
use crate::pipeline::{BatchNo, Epoch, GridMessage, PipelineContext};
use crate::pool::WorkQueuePool;

/// How long the manager waits for the grid to become active before
/// re-checking for results and resync requests.
const ACTIVE_WAIT: Duration = Duration::from_millis(100);

/// Poll interval for the request and result queues.
const POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridJob {
    pub batch: BatchNo,
    pub source: PathBuf,
    /// Render from this file instead of `source` when set.
    pub thumbnail: Option<PathBuf>,
    pub canvas: CellSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridResult {
    pub batch: BatchNo,
    pub source: PathBuf,
    pub thumbnail: Option<PathBuf>,
    /// `None` when the cell could not be rendered.
    pub rendered: Option<Rendered>,
    pub canvas: CellSize,
}

/// Pool task rendering one grid cell per job.
pub struct GridTask {
    renderer: Arc<dyn Renderer>,
    style: StyleParams,
}

impl Task for GridTask {
    type Params = RenderParams;
    type Job = GridJob;
    type Output = GridResult;

    const KIND: &'static str = "grid";
    const NAME: &'static str = "GridRenderer";

    fn from_params(params: RenderParams, _index: usize) -> anyhow::Result<Self> {
        Ok(Self {
            renderer: params.renderer.build(),
            style: params.style,
        })
    }

    fn run(&mut self, job: GridJob, emit: &mut dyn FnMut(GridResult)) {
        // Thumbnails are already small; let them fill the cell.
        let (path, mode) = match &job.thumbnail {
            Some(thumbnail) => (thumbnail, SizeMode::Fit),
            None => (&job.source, SizeMode::Auto),
        };
        let rendered = match self.renderer.encode(path, job.canvas, &self.style.with_mode(mode)) {
            Ok(rendered) => Some(rendered),
            Err(e) => {
                trace!(source = ?job.source, error = %e, "Failed to render grid cell");
                None
            }
        };
        emit(GridResult {
            batch: job.batch,
            source: job.source,
            thumbnail: job.thumbnail,
            rendered,
            canvas: job.canvas,
        });
    }
}

/// Handle to the grid render manager thread.
pub struct GridRenderManager {
    handle: Option<JoinHandle<()>>,
}

impl GridRenderManager {
    /// Start managing `pool` on a new thread.
    pub fn start(ctx: Arc<PipelineContext>, pool: WorkQueuePool<GridTask>) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("GridRenderManager".to_string())
            .spawn(move || {
                let mut state = GridState::new(ctx, pool);
                state.run();
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the manager to exit. The context must be quitting.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Grid render manager panicked");
            }
        }
    }
}

impl Drop for GridRenderManager {
    fn drop(&mut self) {
        self.join();
    }
}

struct GridState {
    ctx: Arc<PipelineContext>,
    pool: WorkQueuePool<GridTask>,
    batch: BatchNo,
    canvas: CellSize,
    /// Sources of the current batch being rendered. Finished cells are
    /// found in the grid cache instead, and are rendered again once evicted.
    in_flight: HashSet<PathBuf>,
}

impl GridState {
    fn new(ctx: Arc<PipelineContext>, pool: WorkQueuePool<GridTask>) -> Self {
        let canvas = ctx.display.grid_canvas();
        Self {
            ctx,
            pool,
            batch: BatchNo::default(),
            canvas,
            in_flight: HashSet::new(),
        }
    }

    fn run(&mut self) {
        debug!("Grid render manager started");
        let ctx = Arc::clone(&self.ctx);
        let sync = ctx.resync.renderer();

        while !ctx.is_quitting() {
            let active = ctx.grid_active.wait_timeout(ACTIVE_WAIT);
            if !active && self.pool.results().is_empty() && !sync.is_requested() {
                continue;
            }

            if let Some(epoch) = sync.begin() {
                self.resync(epoch);
                sync.finish(epoch);
                continue;
            }
            if !sync.is_in_sync() {
                continue;
            }

            if ctx.grid_active.is_set() && !self.dispatch() {
                break;
            }
            self.collect();
        }

        sync.close();
        self.pool.shutdown();
        debug!("Grid render manager stopped");
    }

    /// Discard the current batch and drain the grid queue up to the delimiter
    /// of `epoch`.
    fn resync(&mut self, epoch: Epoch) {
        let ctx = &self.ctx;
        ctx.grid_cache.clear();
        self.batch = self.batch.next();
        self.canvas = ctx.display.grid_canvas();
        self.in_flight.clear();

        let purged = self.pool.purge_jobs() + self.pool.purge_results();
        ctx.activity.stop_n(purged);

        let mut dropped = 0usize;
        loop {
            match ctx.grid_queue().recv() {
                Ok(GridMessage::Delimiter(e)) if e == epoch => break,
                Ok(GridMessage::Delimiter(e)) => warn!(epoch = e.0, "Ignoring stale grid delimiter"),
                Ok(GridMessage::Cell { source, thumbnail }) => {
                    // Requests of the old batch are dropped, but their
                    // thumbnails must not stay pinned.
                    if let (Some(cache), Some(thumbnail)) = (&ctx.thumbnails, thumbnail) {
                        cache.mark_rendered(&source, &thumbnail);
                    }
                    dropped += 1;
                }
                Err(_) => return,
            }
        }
        debug!(batch = self.batch.0, purged, dropped, "Grid renderer resynced");
    }

    /// Dispatch at most one request. Returns false if the queue is closed.
    fn dispatch(&mut self) -> bool {
        let ctx = &self.ctx;
        match ctx.grid_queue().recv_timeout(POLL) {
            Ok(GridMessage::Cell { source, thumbnail }) => {
                if self.in_flight.contains(&source) || ctx.grid_cache.contains(&source) {
                    trace!(?source, "Grid cell already requested");
                    if let (Some(cache), Some(thumbnail)) = (&ctx.thumbnails, &thumbnail) {
                        cache.mark_rendered(&source, thumbnail);
                    }
                    return true;
                }
                self.in_flight.insert(source.clone());
                ctx.activity.start();
                self.pool.submit(GridJob {
                    batch: self.batch,
                    source,
                    thumbnail,
                    canvas: self.canvas,
                });
                true
            }
            Ok(GridMessage::Delimiter(e)) => {
                warn!(epoch = e.0, "Grid delimiter outside of a resync");
                true
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Apply at most one result.
    fn collect(&mut self) {
        let ctx = &self.ctx;
        let Ok(result) = self.pool.recv_timeout(POLL) else {
            return;
        };
        ctx.activity.stop();

        if let (Some(cache), Some(thumbnail)) = (&ctx.thumbnails, &result.thumbnail) {
            cache.mark_rendered(&result.source, thumbnail);
        }
        if result.batch != self.batch {
            trace!(source = ?result.source, "Dropping stale grid cell");
            return;
        }
        self.in_flight.remove(&result.source);
        if !ctx.resync.renderer().is_in_sync() || ctx.is_quitting() {
            trace!(source = ?result.source, "Dropping grid cell during resync");
            return;
        }

        let canvas = match result.rendered {
            Some(rendered) => Canvas::Rendered(rendered),
            None => Canvas::Faulty(result.canvas),
        };
        ctx.grid_cache.put(result.source, canvas);
        if ctx.grid_active.is_set() {
            ctx.redraw.notify();
        }
    }
}
