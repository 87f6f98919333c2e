//! Render pipeline plumbing.
//!
//! [`PipelineContext`] is the state shared by the render managers, the
//! thumbnail manager and the UI: the redraw signal, the loading counter, the
//! grid queues, the grid cell cache and the resync handshakes. It is created
//! once per [`Session`](session::Session) and passed around in an `Arc`.

pub mod resync;
pub mod session;

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::render::{Canvas, CellSize, Subject, SubjectId};
use crate::thumbnails::ThumbnailCache;

pub use resync::{Handshake, ResyncCoordinator};
pub use session::Session;

/// A settable flag that threads can wait on.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    changed: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.flag.lock() = true;
        self.changed.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Wait up to `timeout` for the flag to be set. Returns the flag.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        if !*flag {
            self.changed.wait_for(&mut flag, timeout);
        }
        *flag
    }
}

/// Coalescing "please redraw" notification for the UI loop.
#[derive(Debug, Clone)]
pub struct RedrawSignal {
    tx: Sender<()>,
}

impl RedrawSignal {
    /// The receiver holds at most one pending notification.
    pub fn new() -> (Self, Receiver<()>) {
        let (tx, rx) = flume::bounded(1);
        (Self { tx }, rx)
    }

    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Count of pending background operations, for a loading indicator.
#[derive(Debug, Default)]
pub struct Activity(AtomicIsize);

impl Activity {
    pub fn start(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stop_n(1);
    }

    pub fn stop_n(&self, n: usize) {
        self.0.fetch_sub(n as isize, Ordering::SeqCst);
    }

    pub fn count(&self) -> isize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.count() <= 0
    }
}

/// Grid render batch number. Results are only applied to the batch that
/// requested them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BatchNo(pub u32);

impl BatchNo {
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Resync generation; each resync has its own delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Grid render queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridMessage {
    /// Render `source`, from `thumbnail` when there is one.
    Cell {
        source: PathBuf,
        thumbnail: Option<PathBuf>,
    },
    /// Everything before this belongs to the batch that resync `Epoch` ended.
    Delimiter(Epoch),
}

/// Thumbnail queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbMessage {
    Source(PathBuf),
    Delimiter(Epoch),
}

/// Which image subject is currently on screen, and the grid cell canvas.
#[derive(Debug)]
pub struct Display {
    image: Mutex<Option<SubjectId>>,
    grid_canvas: Mutex<CellSize>,
}

impl Display {
    fn new(grid_canvas: CellSize) -> Self {
        Self {
            image: Mutex::new(None),
            grid_canvas: Mutex::new(grid_canvas),
        }
    }

    pub fn set_image(&self, subject: Option<SubjectId>) {
        *self.image.lock() = subject;
    }

    pub fn image(&self) -> Option<SubjectId> {
        *self.image.lock()
    }

    pub fn is_visible(&self, subject: SubjectId) -> bool {
        self.image() == Some(subject)
    }

    /// Canvas size for new grid batches; takes effect on the next resync.
    pub fn set_grid_canvas(&self, size: CellSize) {
        *self.grid_canvas.lock() = size;
    }

    pub fn grid_canvas(&self) -> CellSize {
        *self.grid_canvas.lock()
    }
}

/// Rendered grid cells of the current batch, least recently used evicted.
pub struct GridCache {
    cells: Mutex<LruCache<PathBuf, Canvas>>,
}

impl GridCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cells: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, source: &Path) -> Option<Canvas> {
        self.cells.lock().get(source).cloned()
    }

    pub fn contains(&self, source: &Path) -> bool {
        self.cells.lock().contains(source)
    }

    pub fn put(&self, source: PathBuf, canvas: Canvas) {
        self.cells.lock().put(source, canvas);
    }

    pub fn clear(&self) {
        self.cells.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State shared by every part of the pipeline.
pub struct PipelineContext {
    pub config: Config,
    pub redraw: RedrawSignal,
    pub activity: Activity,
    /// Set while the image grid is on screen.
    pub grid_active: Event,
    pub display: Display,
    pub grid_cache: GridCache,
    /// Thumbnail bookkeeping; `None` when thumbnailing is disabled.
    pub thumbnails: Option<ThumbnailCache>,
    pub resync: ResyncCoordinator,
    quitting: AtomicBool,
    next_subject: AtomicU64,
    grid_tx: Sender<GridMessage>,
    grid_rx: Receiver<GridMessage>,
    thumb_tx: Sender<ThumbMessage>,
    thumb_rx: Receiver<ThumbMessage>,
}

impl PipelineContext {
    /// Returns the context and the receiving end of its redraw signal.
    pub fn new(config: Config, thumbnails: Option<ThumbnailCache>) -> (Arc<Self>, Receiver<()>) {
        let (redraw, redraw_rx) = RedrawSignal::new();
        let (grid_tx, grid_rx) = flume::unbounded();
        let (thumb_tx, thumb_rx) = flume::unbounded();
        let resync = ResyncCoordinator::new(
            grid_tx.clone(),
            thumbnails.is_some().then(|| thumb_tx.clone()),
        );

        let ctx = Self {
            display: Display::new(config.grid_canvas()),
            grid_cache: GridCache::new(config.grid_cache),
            config,
            redraw,
            activity: Activity::default(),
            grid_active: Event::new(),
            thumbnails,
            resync,
            quitting: AtomicBool::new(false),
            next_subject: AtomicU64::new(1),
            grid_tx,
            grid_rx,
            thumb_tx,
            thumb_rx,
        };
        (Arc::new(ctx), redraw_rx)
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    /// Tell every manager to wind down.
    pub fn quit(&self) {
        self.quitting.store(true, Ordering::SeqCst);
        self.grid_active.set();
    }

    pub fn thumbnailing(&self) -> bool {
        self.thumbnails.is_some()
    }

    /// A fresh subject for displaying `path`.
    pub fn new_subject(&self, path: &Path) -> Subject {
        Subject {
            id: SubjectId(self.next_subject.fetch_add(1, Ordering::Relaxed)),
            path: path.to_path_buf(),
        }
    }

    /// Ask for the grid cell of `source` to be rendered (through the
    /// thumbnailer when thumbnailing is enabled).
    pub fn request_grid_cell(&self, source: &Path) {
        if self.thumbnailing() {
            let _ = self.thumb_tx.send(ThumbMessage::Source(source.to_path_buf()));
        } else {
            let _ = self.grid_tx.send(GridMessage::Cell {
                source: source.to_path_buf(),
                thumbnail: None,
            });
        }
    }

    pub(crate) fn grid_sender(&self) -> &Sender<GridMessage> {
        &self.grid_tx
    }

    pub(crate) fn grid_queue(&self) -> &Receiver<GridMessage> {
        &self.grid_rx
    }

    pub(crate) fn thumb_queue(&self) -> &Receiver<ThumbMessage> {
        &self.thumb_rx
    }
}
