//! Concurrent back-end of a terminal image browser.
//!
//! - `scanner` discovers displayable content and streams directory entries
//! - `render` and `thumbnails` produce terminal output through worker pools
//! - `pipeline` ties the pools together and owns the grid resync protocol
//! - `navigation` is the directory navigation state machine driving them

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod navigation;
pub mod pipeline;
pub mod pool;
pub mod render;
pub mod scanner;
pub mod thumbnails;

use executor::Task;

/// Serve one pool worker over stdin/stdout.
///
/// This is the child side of [`executor::ProcessExecutor`]; the binary calls it
/// when started as `termview --worker <kind> <index>`.
pub fn serve_worker(kind: &str, index: usize) -> anyhow::Result<()> {
    match kind {
        scanner::directory::DirTask::KIND => executor::serve::<scanner::directory::DirTask>(index),
        render::image::ImageTask::KIND => executor::serve::<render::image::ImageTask>(index),
        render::anim::AnimTask::KIND => executor::serve::<render::anim::AnimTask>(index),
        render::grid::GridTask::KIND => executor::serve::<render::grid::GridTask>(index),
        thumbnails::generator::ThumbnailTask::KIND => {
            executor::serve::<thumbnails::generator::ThumbnailTask>(index)
        }
        other => Err(error::ExecutorError::UnknownKind(other.to_string()).into()),
    }
}
