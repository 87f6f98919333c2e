//! Grid thumbnail manager.
//!
//! Sits in front of the grid renderer: grid cell requests arrive on the
//! thumbnail queue, are answered from the [`ThumbnailCache`] when possible and
//! otherwise generated on a [`WorkQueuePool`]. Every finished thumbnail is
//! forwarded to the grid queue as a cell to render.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::RecvTimeoutError;
use tracing::{debug, trace, warn};

use super::cache::{delete_files, ThumbnailCache};
use super::generator::{DedupLock, ThumbnailResult, ThumbnailTask};
use crate::pipeline::{Epoch, GridMessage, Handshake, PipelineContext, ThumbMessage};
use crate::pool::WorkQueuePool;

const ACTIVE_WAIT: Duration = Duration::from_millis(100);
const POLL: Duration = Duration::from_millis(20);

/// Handle to the thumbnail manager thread.
pub struct GridThumbnailManager {
    handle: Option<JoinHandle<()>>,
}

impl GridThumbnailManager {
    /// Start managing `pool`. The context must have thumbnailing enabled.
    pub fn start(ctx: Arc<PipelineContext>, pool: WorkQueuePool<ThumbnailTask>) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("GridThumbnailManager".to_string())
            .spawn(move || match ctx.thumbnails.clone() {
                Some(cache) => ThumbState::new(ctx, cache, pool).run(),
                None => warn!("Thumbnail manager started without a thumbnail cache"),
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the manager to exit. The context must be quitting.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Thumbnail manager panicked");
            }
        }
    }
}

impl Drop for GridThumbnailManager {
    fn drop(&mut self) {
        self.join();
    }
}

struct ThumbState {
    ctx: Arc<PipelineContext>,
    cache: ThumbnailCache,
    pool: WorkQueuePool<ThumbnailTask>,
    /// Jobs submitted and not yet answered.
    in_flight: usize,
    /// Sources with a job in flight.
    pending: HashSet<PathBuf>,
    /// Taken around deletions so generators never copy a vanishing duplicate.
    dedup: Option<DedupLock>,
}

impl ThumbState {
    fn new(ctx: Arc<PipelineContext>, cache: ThumbnailCache, pool: WorkQueuePool<ThumbnailTask>) -> Self {
        let dedup = DedupLock::open(cache.dir())
            .map_err(|e| warn!(error = %e, "Deleting thumbnails without the deduplication lock"))
            .ok();
        Self {
            ctx,
            cache,
            pool,
            in_flight: 0,
            pending: HashSet::new(),
            dedup,
        }
    }

    fn run(mut self) {
        debug!(dir = ?self.cache.dir(), "Thumbnail manager started");
        let ctx = Arc::clone(&self.ctx);
        let Some(sync) = ctx.resync.thumbnailer() else {
            warn!("No thumbnailer handshake; thumbnail manager exiting");
            return;
        };

        while !ctx.is_quitting() {
            let active = ctx.grid_active.wait_timeout(ACTIVE_WAIT);
            if !active && self.in_flight == 0 && !sync.is_requested() && !self.cache.has_pending_deletions() {
                continue;
            }

            if let Some(epoch) = sync.begin() {
                self.resync(epoch);
                sync.finish(epoch);
                continue;
            }

            self.delete(&self.cache.take_deletable());
            if active && !self.dispatch() {
                break;
            }
            if self.in_flight > 0 {
                self.collect(sync);
            }
        }

        sync.close();
        self.pool.shutdown();
        self.ctx.activity.stop_n(self.in_flight);
        debug!("Thumbnail manager stopped");
    }

    fn resync(&mut self, epoch: Epoch) {
        // The renderer must stop using thumbnails before in-flight marks are
        // forgotten.
        self.ctx.resync.renderer().wait_started();
        self.cache.reset_in_flight();

        let purged = self.pool.purge_jobs();
        self.in_flight = self.in_flight.saturating_sub(purged);
        self.ctx.activity.stop_n(purged);

        // Jobs already running still produce files; keep them if there is room.
        while self.in_flight > 0 {
            match self.pool.recv_timeout(ACTIVE_WAIT) {
                Ok(result) => {
                    self.in_flight -= 1;
                    self.ctx.activity.stop();
                    self.store_late(result);
                }
                Err(RecvTimeoutError::Timeout) if self.pool.alive_count() > 0 => {}
                Err(_) => {
                    warn!(lost = self.in_flight, "Thumbnail workers gone during resync");
                    self.ctx.activity.stop_n(self.in_flight);
                    self.in_flight = 0;
                }
            }
        }
        self.pending.clear();
        self.delete(&self.cache.take_all_deletions());

        let mut dropped = 0usize;
        loop {
            match self.ctx.thumb_queue().recv() {
                Ok(ThumbMessage::Delimiter(e)) if e == epoch => break,
                Ok(ThumbMessage::Delimiter(e)) => warn!(epoch = e.0, "Ignoring stale thumbnail delimiter"),
                Ok(ThumbMessage::Source(_)) => dropped += 1,
                Err(_) => return,
            }
        }
        debug!(epoch = epoch.0, dropped, "Thumbnailer resynced");
    }

    /// Handle at most one request. Returns false if the queue is closed.
    fn dispatch(&mut self) -> bool {
        match self.ctx.thumb_queue().recv_timeout(POLL) {
            Ok(ThumbMessage::Source(source)) => {
                if let Some(thumbnail) = self.cache.acquire(&source) {
                    trace!(?source, "Thumbnail cache hit");
                    self.forward(source, Some(thumbnail));
                } else if self.pending.insert(source.clone()) && self.pool.submit(source) {
                    self.in_flight += 1;
                    self.ctx.activity.start();
                }
                true
            }
            Ok(ThumbMessage::Delimiter(e)) => {
                warn!(epoch = e.0, "Thumbnail delimiter outside of a resync");
                true
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Apply at most one result.
    fn collect(&mut self, sync: &Handshake) {
        let Ok(result) = self.pool.recv_timeout(POLL) else {
            return;
        };
        self.in_flight -= 1;
        self.ctx.activity.stop();
        self.pending.remove(&result.source);

        let forward = sync.is_in_sync() && !self.ctx.is_quitting();
        match result.thumbnail {
            Some(thumbnail) => {
                if forward {
                    self.cache.mark_being_rendered(&result.source, &thumbnail);
                }
                let delete = self
                    .cache
                    .record(&result.source, &thumbnail, result.deduplicated.as_deref());
                self.delete(&delete);
                if forward {
                    self.forward(result.source, Some(thumbnail));
                }
            }
            // Let the renderer try the source itself
            None if forward => self.forward(result.source, None),
            None => {}
        }
    }

    /// Keep a result that arrived during a resync, unless it would evict a
    /// thumbnail of the new batch.
    fn store_late(&self, result: ThumbnailResult) {
        let Some(thumbnail) = result.thumbnail else {
            return;
        };
        if self.cache.is_full() && result.deduplicated.is_none() {
            self.delete(&[thumbnail]);
            return;
        }
        let delete = self
            .cache
            .record(&result.source, &thumbnail, result.deduplicated.as_deref());
        self.delete(&delete);
    }

    fn delete(&self, paths: &[PathBuf]) {
        if paths.is_empty() {
            return;
        }
        let _guard = self.dedup.as_ref().and_then(|lock| {
            lock.lock()
                .map_err(|e| warn!(error = %e, "Failed to take the deduplication lock"))
                .ok()
        });
        delete_files(paths);
    }

    fn forward(&self, source: PathBuf, thumbnail: Option<PathBuf>) {
        let _ = self
            .ctx
            .grid_sender()
            .send(GridMessage::Cell { source, thumbnail });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::Executor;
    use crate::scanner::test_util::write_png;
    use crate::thumbnails::generator::ThumbnailParams;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        ctx: Arc<PipelineContext>,
        manager: GridThumbnailManager,
        thumbs: PathBuf,
        _temp: TempDir,
    }

    fn start(max_sources: usize) -> Fixture {
        let temp = tempdir().unwrap();
        let thumbs = temp.path().join("thumbnails");
        std::fs::create_dir(&thumbs).unwrap();
        let cache = ThumbnailCache::new(thumbs.clone(), max_sources);
        let (ctx, _redraw) = PipelineContext::new(Config::default(), Some(cache));
        let params = ThumbnailParams {
            dir: thumbs.clone(),
            size: 32,
        };
        let pool = WorkQueuePool::<ThumbnailTask>::new(&Executor::threads(), 2, params).unwrap();
        let manager = GridThumbnailManager::start(Arc::clone(&ctx), pool).unwrap();
        ctx.grid_active.set();
        Fixture {
            ctx,
            manager,
            thumbs,
            _temp: temp,
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.ctx.quit();
        }
    }

    fn next_cell(ctx: &PipelineContext) -> (PathBuf, Option<PathBuf>) {
        match ctx.grid_queue().recv_timeout(Duration::from_secs(5)).unwrap() {
            GridMessage::Cell { source, thumbnail } => (source, thumbnail),
            other => panic!("unexpected message {:?}", other),
        }
    }

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_generated_thumbnail_is_forwarded_and_cached() {
        let src = tempdir().unwrap();
        let a = src.path().join("a.png");
        write_png(&a, 1);

        let mut fx = start(0);
        fx.ctx.request_grid_cell(&a);
        let (source, thumbnail) = next_cell(&fx.ctx);
        assert_eq!(source, a);
        let thumbnail = thumbnail.unwrap();
        assert!(thumbnail.exists());

        let cache = fx.ctx.thumbnails.as_ref().unwrap();
        assert_eq!(cache.get(&a), Some(thumbnail.clone()));

        // The second request is a cache hit
        fx.ctx.request_grid_cell(&a);
        assert_eq!(next_cell(&fx.ctx), (a.clone(), Some(thumbnail)));
        assert_eq!(file_count(&fx.thumbs), 1);
        assert!(wait_for(|| fx.ctx.activity.is_idle()));

        fx.ctx.quit();
        fx.manager.join();
    }

    #[test]
    fn test_failed_thumbnail_forwards_source() {
        let src = tempdir().unwrap();
        let bad = src.path().join("bad.png");
        std::fs::write(&bad, "nope").unwrap();

        let mut fx = start(0);
        fx.ctx.request_grid_cell(&bad);
        assert_eq!(next_cell(&fx.ctx), (bad, None));
        assert_eq!(file_count(&fx.thumbs), 0);

        fx.ctx.quit();
        fx.manager.join();
    }

    #[test]
    fn test_cache_bound_deletes_evicted_files() {
        let src = tempdir().unwrap();
        let mut fx = start(2);
        let cache = fx.ctx.thumbnails.clone().unwrap();

        for shade in 0..4u8 {
            let source = src.path().join(format!("{}.png", shade));
            write_png(&source, shade * 40);
            fx.ctx.request_grid_cell(&source);
            let (_, thumbnail) = next_cell(&fx.ctx);
            // Nothing renders here, so release the thumbnail at once
            cache.mark_rendered(&source, &thumbnail.unwrap());
        }

        assert!(cache.source_count() <= 2);
        assert!(wait_for(|| file_count(&fx.thumbs) <= 2));

        fx.ctx.quit();
        fx.manager.join();
    }
}
