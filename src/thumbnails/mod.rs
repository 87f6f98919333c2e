//! Grid thumbnails.
//!
//! - [`generator`]: renders a source image into a small PNG, deduplicating
//!   identical pixels
//! - [`cache`]: maps sources to thumbnail files and bounds their number
//! - [`manager`]: the thread feeding generated thumbnails to the grid renderer

pub mod cache;
pub mod generator;
pub mod manager;

pub use cache::ThumbnailCache;
pub use manager::GridThumbnailManager;
