//! Single image rendering.
//!
//! The UI asks for the subject on screen to be rendered at a given size. The
//! manager thread skips requests for subjects that are no longer visible, or
//! that a newer request has already superseded, and renders the rest one at
//! a time on a [`WorkQueuePool`].

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{Canvas, CellSize, FaultLog, RenderParams, Rendered, Renderer, StyleParams, Subject, SubjectId};
use crate::executor::Task;
use crate::pipeline::PipelineContext;
use crate::pool::WorkQueuePool;

/// How often a manager waiting on a result checks whether to give up.
const RESULT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageJob {
    pub subject: SubjectId,
    pub source: PathBuf,
    pub size: CellSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResult {
    pub subject: SubjectId,
    pub size: CellSize,
    /// `Err` holds the render error message.
    pub rendered: Result<Rendered, String>,
}

/// Pool task rendering still images.
pub struct ImageTask {
    renderer: Arc<dyn Renderer>,
    style: StyleParams,
}

impl Task for ImageTask {
    type Params = RenderParams;
    type Job = ImageJob;
    type Output = ImageResult;

    const KIND: &'static str = "image";
    const NAME: &'static str = "ImageRenderer";

    fn from_params(params: RenderParams, _index: usize) -> anyhow::Result<Self> {
        Ok(Self {
            renderer: params.renderer.build(),
            style: params.style,
        })
    }

    fn run(&mut self, job: ImageJob, emit: &mut dyn FnMut(ImageResult)) {
        let rendered = self
            .renderer
            .encode(&job.source, job.size, &self.style)
            .map_err(|e| e.to_string());
        emit(ImageResult {
            subject: job.subject,
            size: job.size,
            rendered,
        });
    }
}

/// A render request from the UI.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub subject: Subject,
    pub size: CellSize,
}

/// A finished render for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutcome {
    pub subject: SubjectId,
    pub size: CellSize,
    pub canvas: Canvas,
}

pub struct ImageRenderManager {
    requests: Sender<Option<ImageRequest>>,
    outcomes: Receiver<ImageOutcome>,
    handle: Option<JoinHandle<()>>,
}

impl ImageRenderManager {
    pub fn start(ctx: Arc<PipelineContext>, pool: WorkQueuePool<ImageTask>) -> std::io::Result<Self> {
        let (requests, requests_rx) = flume::unbounded();
        let (outcomes_tx, outcomes) = flume::unbounded();
        let handle = thread::Builder::new()
            .name("ImageRenderManager".to_string())
            .spawn(move || {
                let mut state = ImageState {
                    ctx,
                    pool,
                    requests: requests_rx,
                    outcomes: outcomes_tx,
                    faulty: FaultLog::default(),
                };
                state.run();
            })?;
        Ok(Self {
            requests,
            outcomes,
            handle: Some(handle),
        })
    }

    /// Ask for `subject` to be rendered into `size`. The subject must be set
    /// as the displayed image, or the request is skipped.
    pub fn request(&self, subject: Subject, size: CellSize) {
        let _ = self.requests.send(Some(ImageRequest { subject, size }));
    }

    pub fn outcomes(&self) -> &Receiver<ImageOutcome> {
        &self.outcomes
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.requests.send(None);
            if handle.join().is_err() {
                warn!("Image render manager panicked");
            }
        }
    }
}

impl Drop for ImageRenderManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ImageState {
    ctx: Arc<PipelineContext>,
    pool: WorkQueuePool<ImageTask>,
    requests: Receiver<Option<ImageRequest>>,
    outcomes: Sender<ImageOutcome>,
    faulty: FaultLog,
}

impl ImageState {
    fn run(&mut self) {
        debug!("Image render manager started");
        while let Ok(Some(request)) = self.requests.recv() {
            if self.ctx.is_quitting() {
                break;
            }
            let id = request.subject.id;
            if !self.ctx.display.is_visible(id) || !self.requests.is_empty() {
                trace!(subject = id.0, "Skipping superseded image render");
                continue;
            }
            if let Some(outcome) = self.render(request) {
                if self.ctx.display.is_visible(id) {
                    let _ = self.outcomes.send(outcome);
                    self.ctx.redraw.notify();
                }
            }
        }
        self.pool.shutdown();
        debug!("Image render manager stopped");
    }

    fn render(&mut self, request: ImageRequest) -> Option<ImageOutcome> {
        let ImageRequest { subject, size } = request;
        self.ctx.activity.start();
        self.pool.submit(ImageJob {
            subject: subject.id,
            source: subject.path.clone(),
            size,
        });

        let result = loop {
            match self.pool.recv_timeout(RESULT_POLL) {
                Ok(result) => break Some(result),
                Err(RecvTimeoutError::Timeout) if !self.ctx.is_quitting() && self.pool.alive_count() > 0 => {}
                Err(_) => break None,
            }
        };
        self.ctx.activity.stop();
        if self.ctx.is_quitting() {
            return None;
        }

        let canvas = match result.map(|r| r.rendered) {
            Some(Ok(rendered)) => Canvas::Rendered(rendered),
            Some(Err(e)) => {
                if self.faulty.first(&subject.path) {
                    warn!(path = ?subject.path, error = %e, "Failed to render image");
                }
                Canvas::Faulty(size)
            }
            None => {
                warn!(path = ?subject.path, "Image renderer gone");
                Canvas::Faulty(size)
            }
        };
        Some(ImageOutcome {
            subject: subject.id,
            size,
            canvas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::Executor;
    use crate::scanner::test_util::write_png;
    use tempfile::tempdir;

    fn start(ctx: &Arc<PipelineContext>) -> ImageRenderManager {
        let pool = WorkQueuePool::<ImageTask>::new(&Executor::threads(), 1, RenderParams::default()).unwrap();
        ImageRenderManager::start(Arc::clone(ctx), pool).unwrap()
    }

    #[test]
    fn test_visible_subject_is_rendered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        write_png(&path, 7);

        let (ctx, redraw) = PipelineContext::new(Config::default(), None);
        let manager = start(&ctx);
        let subject = ctx.new_subject(&path);
        ctx.display.set_image(Some(subject.id));
        manager.request(subject.clone(), CellSize::new(20, 10));

        let outcome = manager.outcomes().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.subject, subject.id);
        match outcome.canvas {
            Canvas::Rendered(rendered) => assert!(!rendered.size.is_empty()),
            other => panic!("unexpected canvas {:?}", other),
        }
        assert!(redraw.try_recv().is_ok());
        assert!(ctx.activity.is_idle());
    }

    #[test]
    fn test_hidden_subject_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        write_png(&path, 7);

        let (ctx, _redraw) = PipelineContext::new(Config::default(), None);
        let mut manager = start(&ctx);
        let hidden = ctx.new_subject(&path);
        let shown = ctx.new_subject(&path);
        ctx.display.set_image(Some(shown.id));

        manager.request(hidden, CellSize::new(20, 10));
        manager.request(shown.clone(), CellSize::new(20, 10));
        let outcome = manager.outcomes().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.subject, shown.id);

        manager.shutdown();
        assert!(manager.outcomes().try_recv().is_err());
    }

    #[test]
    fn test_unreadable_image_is_faulty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, "garbage").unwrap();

        let (ctx, _redraw) = PipelineContext::new(Config::default(), None);
        let manager = start(&ctx);
        let subject = ctx.new_subject(&path);
        ctx.display.set_image(Some(subject.id));
        let size = CellSize::new(12, 6);
        manager.request(subject.clone(), size);
        manager.request(subject, size);

        let outcome = manager.outcomes().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.canvas, Canvas::Faulty(size));
    }
}
