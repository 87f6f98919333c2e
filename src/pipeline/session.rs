//! Session lifetime.
//!
//! A [`Session`] owns everything one browsing session runs: the shared
//! [`PipelineContext`], every render manager with its pool, the two entry
//! scanners and the temporary directory holding thumbnails. Dropping it stops
//! the managers, joins every worker and removes the temporary directory, on
//! normal exit as well as on unwind.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use flume::Receiver;
use tempfile::TempDir;
use tracing::{debug, error, info};

use super::{Epoch, PipelineContext};
use crate::config::Config;
use crate::error::ThumbnailError;
use crate::executor::Executor;
use crate::pool::WorkQueuePool;
use crate::render::anim::{AnimOutcome, AnimRenderManager};
use crate::render::grid::{GridRenderManager, GridTask};
use crate::render::image::{ImageOutcome, ImageRenderManager, ImageTask};
use crate::render::{Canvas, CellSize, RenderParams, Renderer, Subject};
use crate::scanner::directory::DirectoryScanner;
use crate::scanner::entries::{EntryScanner, ListOptions};
use crate::scanner::tree::ContentTree;
use crate::thumbnails::generator::{ThumbnailParams, ThumbnailTask};
use crate::thumbnails::{GridThumbnailManager, ThumbnailCache};

/// Prefix of the per-session temporary directory.
const TEMP_PREFIX: &str = "termview-";

/// Thumbnail directory inside the temporary directory.
const THUMBNAIL_DIR: &str = "thumbnails";

struct ThumbnailSetup {
    temp_dir: TempDir,
    cache: ThumbnailCache,
    pool: WorkQueuePool<ThumbnailTask>,
}

fn setup_thumbnails(config: &Config, executor: &Executor) -> Result<ThumbnailSetup, ThumbnailError> {
    let temp_dir = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempdir()
        .map_err(ThumbnailError::TempDir)?;
    let dir = temp_dir.path().join(THUMBNAIL_DIR);
    fs::create_dir(&dir).map_err(|source| ThumbnailError::ThumbnailDir {
        path: dir.clone(),
        source,
    })?;

    let params = ThumbnailParams {
        dir: dir.clone(),
        size: config.thumbnail_size,
    };
    let pool = WorkQueuePool::new(executor, 1, params)?;
    Ok(ThumbnailSetup {
        temp_dir,
        cache: ThumbnailCache::new(dir, config.thumbnail_cache),
        pool,
    })
}

pub struct Session {
    ctx: Arc<PipelineContext>,
    redraw: Receiver<()>,
    executor: Arc<Executor>,
    renderer: Arc<dyn Renderer>,
    image: ImageRenderManager,
    anim: AnimRenderManager,
    grid: GridRenderManager,
    thumbnails: Option<GridThumbnailManager>,
    menu: EntryScanner,
    grid_entries: EntryScanner,
    /// Removed last, after every worker that might write into it is gone.
    temp_dir: Option<TempDir>,
}

impl Session {
    /// Start a session with the executor the config selects.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let executor = Executor::from_config(&config);
        Self::with_executor(config, executor)
    }

    pub fn with_executor(config: Config, executor: Executor) -> anyhow::Result<Self> {
        info!(executor = executor.describe(), "Starting session");
        let render = RenderParams::default();

        let (thumbnail_setup, thumbnail_cache) = if config.thumbnail {
            match setup_thumbnails(&config, &executor) {
                Ok(setup) => {
                    let cache = setup.cache.clone();
                    (Some(setup), Some(cache))
                }
                Err(e) => {
                    error!(error = %e, "Thumbnails disabled");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let list_options = ListOptions {
            show_hidden: config.show_hidden,
            recursive: config.recursive,
        };
        let grid_workers = config.grid_renderer_count();
        let (ctx, redraw) = PipelineContext::new(config, thumbnail_cache);

        let image_pool = WorkQueuePool::<ImageTask>::new(&executor, 1, render).context("Failed to start image renderer")?;
        let image =
            ImageRenderManager::start(Arc::clone(&ctx), image_pool).context("Failed to start image render manager")?;
        let anim = AnimRenderManager::start(Arc::clone(&ctx), &executor, render)
            .context("Failed to start animation renderer")?;
        let grid_pool =
            WorkQueuePool::<GridTask>::new(&executor, grid_workers, render).context("Failed to start grid renderers")?;
        let grid =
            GridRenderManager::start(Arc::clone(&ctx), grid_pool).context("Failed to start grid render manager")?;

        let (thumbnails, temp_dir) = match thumbnail_setup {
            Some(setup) => {
                let manager = GridThumbnailManager::start(Arc::clone(&ctx), setup.pool)
                    .context("Failed to start thumbnail manager")?;
                (Some(manager), Some(setup.temp_dir))
            }
            None => (None, None),
        };

        let menu = EntryScanner::spawn("MenuScanner", list_options, ctx.redraw.clone())
            .context("Failed to start menu scanner")?;
        let grid_entries = EntryScanner::spawn("GridScanner", list_options, ctx.redraw.clone())
            .context("Failed to start grid scanner")?;

        Ok(Self {
            ctx,
            redraw,
            executor: Arc::new(executor),
            renderer: render.renderer.build(),
            image,
            anim,
            grid,
            thumbnails,
            menu,
            grid_entries,
            temp_dir,
        })
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Fires whenever something new can be drawn.
    pub fn redraw(&self) -> &Receiver<()> {
        &self.redraw
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// A directory scanner sharing this session's executor.
    pub fn scanner(&self) -> DirectoryScanner {
        DirectoryScanner::from_config(&self.ctx.config, Arc::clone(&self.executor))
    }

    /// Directory the thumbnails of this session are written to.
    pub fn thumbnail_dir(&self) -> Option<&Path> {
        self.ctx.thumbnails.as_ref().map(ThumbnailCache::dir)
    }

    /// Display `path` as a still image of at most `size`.
    pub fn show_image(&self, path: &Path, size: CellSize) -> Subject {
        let subject = self.ctx.new_subject(path);
        self.ctx.display.set_image(Some(subject.id));
        self.image.request(subject.clone(), size);
        subject
    }

    /// Display `path` as an animation of at most `size`.
    pub fn play_animation(&self, path: &Path, size: CellSize) -> Subject {
        let subject = self.ctx.new_subject(path);
        self.ctx.display.set_image(Some(subject.id));
        self.anim.play(subject.clone(), size);
        subject
    }

    /// Render the displayed subject again at a new size.
    pub fn resize_image(&self, subject: &Subject, size: CellSize, animated: bool) {
        if animated {
            self.anim.resize(subject.id, size);
        } else {
            self.image.request(subject.clone(), size);
        }
    }

    /// Take the image off the screen.
    pub fn hide_image(&self) {
        self.ctx.display.set_image(None);
        self.anim.stop();
        if self.renderer.clear() {
            self.ctx.redraw.notify();
        }
    }

    pub fn image_outcomes(&self) -> &Receiver<ImageOutcome> {
        self.image.outcomes()
    }

    pub fn anim_outcomes(&self) -> &Receiver<AnimOutcome> {
        self.anim.outcomes()
    }

    /// Show the grid for `dir` and start listing its entries. With `resync`,
    /// cells of the previous grid are discarded first.
    ///
    /// Returns the generation of the grid listing.
    pub fn open_grid(&self, dir: &Path, tree: Arc<ContentTree>, resync: bool) -> u64 {
        self.ctx.grid_active.set();
        if resync {
            self.resync_grid();
        }
        self.grid_entries.request(dir, tree, None)
    }

    pub fn close_grid(&self) {
        self.grid_entries.interrupt();
        self.ctx.grid_active.clear();
    }

    /// Change the grid cell canvas. Cells already rendered are discarded.
    pub fn set_grid_canvas(&self, size: CellSize) -> Epoch {
        self.ctx.display.set_grid_canvas(size);
        self.resync_grid()
    }

    /// Discard the current grid batch.
    pub fn resync_grid(&self) -> Epoch {
        self.ctx.resync.resync()
    }

    pub fn request_grid_cell(&self, source: &Path) {
        self.ctx.request_grid_cell(source);
    }

    /// The rendered cell of `source`, if ready.
    pub fn grid_cell(&self, source: &Path) -> Option<Canvas> {
        self.ctx.grid_cache.get(source)
    }

    pub fn menu(&self) -> &EntryScanner {
        &self.menu
    }

    pub fn grid_entries(&self) -> &EntryScanner {
        &self.grid_entries
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("Stopping session");
        self.ctx.quit();
        self.ctx.resync.close();

        self.menu.shutdown();
        self.grid_entries.shutdown();
        self.image.shutdown();
        self.anim.shutdown();
        if let Some(thumbnails) = self.thumbnails.as_mut() {
            thumbnails.join();
        }
        self.grid.join();

        if let Some(temp_dir) = self.temp_dir.take() {
            let path = temp_dir.path().to_path_buf();
            if let Err(e) = temp_dir.close() {
                error!(?path, error = %e, "Failed to remove temporary directory");
            }
        }
        debug!("Session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::test_util::write_png;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(thumbnail: bool) -> Config {
        Config {
            thumbnail,
            multi: false,
            ..Config::default()
        }
    }

    #[test]
    fn test_temp_dir_removed_on_drop() {
        let session = Session::with_executor(config(true), Executor::threads()).unwrap();
        let dir = session.thumbnail_dir().unwrap().to_path_buf();
        assert!(dir.is_dir());
        assert!(dir
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(TEMP_PREFIX)));
        drop(session);
        assert!(!dir.exists());
    }

    #[test]
    fn test_thumbnails_disabled() {
        let session = Session::with_executor(config(false), Executor::threads()).unwrap();
        assert!(session.thumbnail_dir().is_none());
        assert!(!session.context().thumbnailing());
    }

    #[test]
    fn test_show_image_and_hide() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        write_png(&path, 3);

        let session = Session::with_executor(config(false), Executor::threads()).unwrap();
        let subject = session.show_image(&path, CellSize::new(10, 5));
        let outcome = session.image_outcomes().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.subject, subject.id);
        assert!(!outcome.canvas.is_faulty());

        session.hide_image();
        assert_eq!(session.context().display.image(), None);
    }

    #[test]
    fn test_open_grid_lists_and_renders() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 1);
        write_png(&dir.path().join("b.png"), 2);

        let session = Session::with_executor(config(true), Executor::threads()).unwrap();
        let generation = session.open_grid(dir.path(), Arc::new(ContentTree::with_images()), true);

        let mut names = Vec::new();
        loop {
            match session.grid_entries().events().recv_timeout(Duration::from_secs(5)).unwrap() {
                crate::scanner::entries::EntryEvent::Entry { generation: g, entry } => {
                    assert_eq!(g, generation);
                    session.request_grid_cell(&dir.path().join(&entry.name));
                    names.push(entry.name);
                }
                crate::scanner::entries::EntryEvent::Done { .. } => break,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(names, vec!["a.png", "b.png"]);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while session.context().grid_cache.len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(session.grid_cell(&dir.path().join("a.png")), Some(Canvas::Rendered(_))));
        assert!(matches!(session.grid_cell(&dir.path().join("b.png")), Some(Canvas::Rendered(_))));
    }
}
