//! Terminal rendering.
//!
//! A [`Renderer`] turns an image file into terminal text of a bounded cell
//! size. The render managers ([`image`], [`anim`], [`grid`]) run renders on
//! worker pools and decide which results are still worth showing.

pub mod anim;
pub mod block;
pub mod grid;
pub mod image;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RenderError;

pub use self::block::BlockRenderer;

/// A size in terminal cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CellSize {
    pub cols: u16,
    pub rows: u16,
}

impl CellSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }
}

/// How an image is fitted into the available area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SizeMode {
    /// Fit, but never scale up.
    #[default]
    Auto,
    /// Fit, scaling up if needed.
    Fit,
}

/// Treatment of transparent pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Alpha {
    /// Pixels with alpha below this ratio are left transparent.
    Threshold(f32),
    /// Blend over a solid background colour.
    Background([u8; 3]),
    /// Ignore alpha.
    Opaque,
}

impl Default for Alpha {
    fn default() -> Self {
        Self::Threshold(40.0 / 255.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StyleParams {
    pub alpha: Alpha,
    pub mode: SizeMode,
}

impl StyleParams {
    pub fn with_mode(mut self, mode: SizeMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Rendered terminal text and the cell area it occupies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendered {
    pub text: String,
    pub size: CellSize,
}

/// What to draw in place of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Canvas {
    Rendered(Rendered),
    /// The image could not be rendered; draw a placeholder of this size.
    Faulty(CellSize),
}

impl Canvas {
    pub fn is_faulty(&self) -> bool {
        matches!(self, Self::Faulty(_))
    }
}

/// One rendered animation frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub rendered: Rendered,
    /// Index of the frame within the current loop.
    pub index: usize,
    /// How long the image wants the frame shown.
    pub delay: Duration,
}

/// Identity of a render subject: one display of one image.
///
/// Showing the same file twice yields two subjects, so results for an earlier
/// display are never mistaken for the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: SubjectId,
    pub path: PathBuf,
}

/// Renderers that leave state on the terminal (e.g. placed graphics) clear it
/// here. The default does nothing.
pub trait Clearable {
    /// Returns whether anything was cleared.
    fn clear(&self) -> bool {
        false
    }
}

/// Successive frames of an animated image.
pub trait FrameSource {
    /// The next frame, or `None` once the animation has finished.
    fn next_frame(&mut self) -> Option<Result<Frame, RenderError>>;

    /// Change the render size of following frames, keeping the position.
    fn set_max_size(&mut self, size: CellSize);
}

pub trait Renderer: Clearable + Send + Sync {
    /// Render a still image (the first frame of an animation).
    fn encode(&self, source: &Path, max_size: CellSize, style: &StyleParams) -> Result<Rendered, RenderError>;

    /// Open an image for frame-by-frame rendering.
    ///
    /// `repeat` is the number of loops to play, -1 for forever.
    fn animate(
        &self,
        source: &Path,
        max_size: CellSize,
        style: &StyleParams,
        repeat: i32,
    ) -> Result<Box<dyn FrameSource>, RenderError>;
}

/// Renderer selection, serialisable so worker processes build the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RendererKind {
    /// ANSI truecolour half blocks.
    #[default]
    Block,
}

impl RendererKind {
    pub fn build(self) -> Arc<dyn Renderer> {
        match self {
            Self::Block => Arc::new(BlockRenderer),
        }
    }
}

/// Renderer construction parameters shared by the render tasks.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RenderParams {
    pub renderer: RendererKind,
    pub style: StyleParams,
}

/// Files whose render failure has been logged, so each is reported once per
/// session however often it is displayed.
#[derive(Debug, Default)]
pub(crate) struct FaultLog(HashSet<PathBuf>);

impl FaultLog {
    /// True the first time `path` is reported.
    pub(crate) fn first(&mut self, path: &Path) -> bool {
        !self.0.contains(path) && self.0.insert(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_log_reports_each_file_once() {
        let mut log = FaultLog::default();
        assert!(log.first(Path::new("/a.png")));
        // A new display of the same file
        assert!(!log.first(Path::new("/a.png")));
        assert!(log.first(Path::new("/b.png")));
    }

    #[test]
    fn test_cell_size_empty() {
        assert!(CellSize::new(0, 3).is_empty());
        assert!(!CellSize::new(1, 1).is_empty());
    }

    #[test]
    fn test_default_renderer_is_not_clearable() {
        assert!(!RendererKind::default().build().clear());
    }
}
