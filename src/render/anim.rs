//! Animation playback.
//!
//! The frame iterator of the playing animation lives inside the worker, so
//! the pool has exactly one worker and every job depends on the ones before
//! it. The manager keeps at most one job in flight and waits for its answer,
//! which is what makes switching subjects safe: before a new animation
//! starts, the old one is stopped and the worker's `Stopped` acknowledgement
//! is drained, so no frame of the old subject can arrive afterwards.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{CellSize, FaultLog, Frame, FrameSource, RenderParams, Renderer, StyleParams, Subject, SubjectId};
use crate::error::ExecutorError;
use crate::executor::{Executor, Task};
use crate::pipeline::PipelineContext;
use crate::pool::WorkQueuePool;

const RESULT_POLL: Duration = Duration::from_millis(100);

/// Shortest time a frame stays on screen.
const MIN_FRAME_DELAY: Duration = Duration::from_millis(20);

/// Idle wait when nothing is playing.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnimParams {
    pub render: RenderParams,
    /// Loops to play, -1 for forever.
    pub repeat: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnimJob {
    /// Open `source` and render its first frame.
    Start {
        subject: SubjectId,
        source: PathBuf,
        size: CellSize,
    },
    /// Render following frames into `size`. No output.
    Resize { size: CellSize },
    Next { subject: SubjectId },
    /// Drop the current animation.
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnimOutput {
    Frame { subject: SubjectId, frame: Frame },
    Finished { subject: SubjectId },
    Failed { subject: SubjectId, error: String },
    Stopped,
}

/// Pool task holding the frame iterator of one animation.
pub struct AnimTask {
    renderer: Arc<dyn Renderer>,
    style: StyleParams,
    repeat: i32,
    current: Option<(SubjectId, Box<dyn FrameSource>)>,
}

impl AnimTask {
    fn advance(&mut self, subject: SubjectId) -> AnimOutput {
        let Some((current, frames)) = self.current.as_mut().filter(|(id, _)| *id == subject) else {
            return AnimOutput::Finished { subject };
        };
        let subject = *current;
        match frames.next_frame() {
            Some(Ok(frame)) => AnimOutput::Frame { subject, frame },
            Some(Err(e)) => {
                self.current = None;
                AnimOutput::Failed {
                    subject,
                    error: e.to_string(),
                }
            }
            None => {
                self.current = None;
                AnimOutput::Finished { subject }
            }
        }
    }
}

impl Task for AnimTask {
    type Params = AnimParams;
    type Job = AnimJob;
    type Output = AnimOutput;

    const KIND: &'static str = "anim";
    const NAME: &'static str = "AnimationRenderer";

    fn from_params(params: AnimParams, _index: usize) -> anyhow::Result<Self> {
        Ok(Self {
            renderer: params.render.renderer.build(),
            style: params.render.style,
            repeat: params.repeat,
            current: None,
        })
    }

    fn run(&mut self, job: AnimJob, emit: &mut dyn FnMut(AnimOutput)) {
        match job {
            AnimJob::Start { subject, source, size } => {
                self.current = None;
                match self.renderer.animate(&source, size, &self.style, self.repeat) {
                    Ok(frames) => {
                        self.current = Some((subject, frames));
                        emit(self.advance(subject));
                    }
                    Err(e) => emit(AnimOutput::Failed {
                        subject,
                        error: e.to_string(),
                    }),
                }
            }
            AnimJob::Resize { size } => {
                if let Some((_, frames)) = self.current.as_mut() {
                    frames.set_max_size(size);
                }
            }
            AnimJob::Next { subject } => emit(self.advance(subject)),
            AnimJob::Stop => {
                self.current = None;
                emit(AnimOutput::Stopped);
            }
        }
    }
}

/// Playback commands from the UI.
#[derive(Debug, Clone)]
pub enum AnimRequest {
    /// Play `subject` from the start, ending whatever plays now.
    Play { subject: Subject, size: CellSize },
    Resize { subject: SubjectId, size: CellSize },
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnimOutcome {
    Frame { subject: SubjectId, frame: Frame },
    Finished { subject: SubjectId },
    /// The animation could not be played; draw a placeholder of `size`.
    Faulty { subject: SubjectId, size: CellSize },
    /// The image is too large to animate; show it as a still image.
    Declined { subject: SubjectId },
}

pub struct AnimRenderManager {
    requests: Sender<Option<AnimRequest>>,
    outcomes: Receiver<AnimOutcome>,
    handle: Option<JoinHandle<()>>,
}

impl AnimRenderManager {
    /// Start the manager with its own single-worker pool.
    pub fn start(ctx: Arc<PipelineContext>, executor: &Executor, render: RenderParams) -> Result<Self, ExecutorError> {
        let params = AnimParams {
            render,
            repeat: ctx.config.repeat,
        };
        let pool = WorkQueuePool::<AnimTask>::new(executor, 1, params)?;
        let (requests, requests_rx) = flume::unbounded();
        let (outcomes_tx, outcomes) = flume::unbounded();
        let handle = thread::Builder::new()
            .name("AnimRenderManager".to_string())
            .spawn(move || {
                let mut state = AnimState {
                    ctx,
                    pool,
                    requests: requests_rx,
                    outcomes: outcomes_tx,
                    playing: None,
                    faulty: FaultLog::default(),
                };
                state.run();
            })
            .map_err(|source| ExecutorError::Thread {
                name: "AnimRenderManager".to_string(),
                source,
            })?;
        Ok(Self {
            requests,
            outcomes,
            handle: Some(handle),
        })
    }

    pub fn play(&self, subject: Subject, size: CellSize) {
        let _ = self.requests.send(Some(AnimRequest::Play { subject, size }));
    }

    pub fn resize(&self, subject: SubjectId, size: CellSize) {
        let _ = self.requests.send(Some(AnimRequest::Resize { subject, size }));
    }

    pub fn stop(&self) {
        let _ = self.requests.send(Some(AnimRequest::Stop));
    }

    pub fn outcomes(&self) -> &Receiver<AnimOutcome> {
        &self.outcomes
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.requests.send(None);
            if handle.join().is_err() {
                warn!("Animation manager panicked");
            }
        }
    }
}

impl Drop for AnimRenderManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Playing {
    subject: Subject,
    size: CellSize,
    /// When the next frame is due.
    due: Instant,
}

struct AnimState {
    ctx: Arc<PipelineContext>,
    pool: WorkQueuePool<AnimTask>,
    requests: Receiver<Option<AnimRequest>>,
    outcomes: Sender<AnimOutcome>,
    playing: Option<Playing>,
    faulty: FaultLog,
}

impl AnimState {
    fn run(&mut self) {
        debug!("Animation manager started");
        loop {
            let due = self
                .playing
                .as_ref()
                .map_or_else(|| Instant::now() + IDLE_WAIT, |p| p.due);
            match self.requests.recv_deadline(due) {
                Ok(Some(AnimRequest::Play { subject, size })) => {
                    self.end_current();
                    self.start(subject, size);
                }
                Ok(Some(AnimRequest::Resize { subject, size })) => {
                    if let Some(playing) = self.playing.as_mut().filter(|p| p.subject.id == subject) {
                        playing.size = size;
                        self.pool.submit(AnimJob::Resize { size });
                    }
                }
                Ok(Some(AnimRequest::Stop)) => self.end_current(),
                Ok(None) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => self.advance(),
            }
            if self.ctx.is_quitting() {
                break;
            }
        }
        self.playing = None;
        self.pool.shutdown();
        debug!("Animation manager stopped");
    }

    fn start(&mut self, subject: Subject, size: CellSize) {
        if !self.ctx.display.is_visible(subject.id) {
            trace!(subject = subject.id.0, "Skipping hidden animation");
            return;
        }
        let max_pixels = self.ctx.config.max_pixels;
        if max_pixels > 0 {
            if let Ok((width, height)) = image::image_dimensions(&subject.path) {
                if u64::from(width) * u64::from(height) > max_pixels {
                    debug!(path = ?subject.path, width, height, "Image too large to animate");
                    let _ = self.outcomes.send(AnimOutcome::Declined { subject: subject.id });
                    self.ctx.redraw.notify();
                    return;
                }
            }
        }

        let job = AnimJob::Start {
            subject: subject.id,
            source: subject.path.clone(),
            size,
        };
        self.playing = Some(Playing {
            subject,
            size,
            due: Instant::now(),
        });
        self.exchange(job);
    }

    /// Request the next frame of the current animation.
    fn advance(&mut self) {
        let Some(playing) = &self.playing else {
            return;
        };
        if !self.ctx.display.is_visible(playing.subject.id) {
            self.end_current();
            return;
        }
        let subject = playing.subject.id;
        self.exchange(AnimJob::Next { subject });
    }

    /// Submit a job that answers with exactly one output, and apply it.
    fn exchange(&mut self, job: AnimJob) {
        self.ctx.activity.start();
        self.pool.submit(job);
        let output = self.receive();
        self.ctx.activity.stop();

        let Some(playing) = self.playing.as_mut() else {
            return;
        };
        match output {
            Some(AnimOutput::Frame { subject, frame }) if subject == playing.subject.id => {
                let delay = self.ctx.config.frame_duration().unwrap_or(frame.delay);
                playing.due = Instant::now() + delay.max(MIN_FRAME_DELAY);
                let _ = self.outcomes.send(AnimOutcome::Frame { subject, frame });
                self.ctx.redraw.notify();
            }
            Some(AnimOutput::Finished { subject }) => {
                debug!(subject = subject.0, "Animation finished");
                self.playing = None;
                let _ = self.outcomes.send(AnimOutcome::Finished { subject });
                self.ctx.redraw.notify();
            }
            Some(AnimOutput::Failed { subject, error }) => {
                if self.faulty.first(&playing.subject.path) {
                    warn!(path = ?playing.subject.path, %error, "Failed to animate image");
                }
                let size = playing.size;
                self.playing = None;
                let _ = self.outcomes.send(AnimOutcome::Faulty { subject, size });
                self.ctx.redraw.notify();
            }
            Some(other) => {
                debug_assert!(false, "unexpected animation output {:?}", other);
                warn!(?other, "Unexpected animation output");
            }
            None => {
                warn!("Animation renderer gone");
                self.playing = None;
            }
        }
    }

    /// Stop the current animation and wait until the worker has let go of it.
    fn end_current(&mut self) {
        if self.playing.take().is_none() {
            return;
        }
        self.pool.submit(AnimJob::Stop);
        while let Some(output) = self.receive() {
            if output == AnimOutput::Stopped {
                break;
            }
            trace!(?output, "Discarding output of ended animation");
        }
    }

    fn receive(&self) -> Option<AnimOutput> {
        loop {
            match self.pool.recv_timeout(RESULT_POLL) {
                Ok(output) => return Some(output),
                Err(RecvTimeoutError::Timeout) if !self.ctx.is_quitting() && self.pool.alive_count() > 0 => {}
                Err(_) => return None,
            }
        }
    }
}
