//! Thumbnail generation using the image crate.
//!
//! Thumbnails fit a square bounding box and are stored as PNG files named
//! `<pixel hash>-<random>.png` in the session thumbnail directory. When a
//! thumbnail with identical pixels already exists, its file is copied instead
//! of encoding a new one, and the caller is told which file it duplicates so
//! the two can be merged in the cache.
//!
//! The duplicate lookup and copy run under a [`DedupLock`], which the thumbnail
//! manager also takes to delete thumbnails, so a match cannot vanish before it
//! is copied.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::executor::Task;
use crate::render::block::open_image;

/// Default bounding square for thumbnails in pixels.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

/// Thumbnail file extension.
const THUMBNAIL_SUFFIX: &str = ".png";

/// Lock serialising duplicate lookups against thumbnail deletion.
///
/// This is an OS file lock on a file next to the thumbnail directory, so it
/// holds between threads and between worker processes alike. Each user opens
/// its own `DedupLock`.
#[derive(Debug)]
pub struct DedupLock {
    file: File,
}

impl DedupLock {
    /// Open the lock guarding `thumbnail_dir`, creating its file if needed.
    pub fn open(thumbnail_dir: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path(thumbnail_dir))?;
        Ok(Self { file })
    }

    /// Block until the lock is held.
    pub fn lock(&self) -> std::io::Result<DedupGuard<'_>> {
        self.file.lock()?;
        Ok(DedupGuard { file: &self.file })
    }
}

/// Releases a [`DedupLock`] when dropped.
pub struct DedupGuard<'a> {
    file: &'a File,
}

impl Drop for DedupGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(error = %e, "Failed to release the deduplication lock");
        }
    }
}

/// `<dir>.lock`, outside the directory so it is never taken for a thumbnail.
pub fn lock_path(thumbnail_dir: &Path) -> PathBuf {
    thumbnail_dir.with_extension("lock")
}

/// A generated thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub thumbnail: PathBuf,
    /// Existing thumbnail with the same pixels that `thumbnail` copies.
    pub deduplicated: Option<PathBuf>,
}

/// Generates thumbnails into one directory.
pub struct ThumbnailGenerator {
    dir: PathBuf,
    size: u32,
    /// Thumbnails reported as duplicates; the cache deletes them, so they
    /// must not be matched again.
    deduplicated: HashSet<PathBuf>,
    lock: DedupLock,
}

impl ThumbnailGenerator {
    /// `dir` must already exist.
    pub fn new(dir: PathBuf, size: u32) -> Result<Self> {
        anyhow::ensure!(dir.is_dir(), "Thumbnail directory {:?} does not exist", dir);
        let lock = DedupLock::open(&dir)
            .with_context(|| format!("Failed to open the deduplication lock of {:?}", dir))?;
        Ok(Self {
            dir,
            size,
            deduplicated: HashSet::new(),
            lock,
        })
    }

    /// Generate the thumbnail of `source`.
    pub fn generate(&mut self, source: &Path) -> Result<Generated> {
        let img = open_image(source).with_context(|| format!("Failed to load image: {:?}", source))?;
        let thumbnail = Self::make_thumbnail(normalize(img), self.size);
        let hash = hash_pixels(thumbnail.as_bytes());

        let named = tempfile::Builder::new()
            .prefix(&format!("{}-", hash))
            .suffix(THUMBNAIL_SUFFIX)
            .tempfile_in(&self.dir)
            .with_context(|| format!("Failed to create thumbnail file in {:?}", self.dir))?;
        let (file, path) = named
            .keep()
            .map_err(|e| e.error)
            .context("Failed to keep thumbnail file")?;

        self.deduplicated.retain(|p| p.exists());

        let copied = match self.copy_duplicate(&hash, &thumbnail, &path) {
            Ok(copied) => copied,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };
        if let Some(duplicate) = copied {
            drop(file);
            trace!(?source, ?duplicate, "Deduplicated thumbnail");
            self.deduplicated.insert(duplicate.clone());
            return Ok(Generated {
                thumbnail: path,
                deduplicated: Some(duplicate),
            });
        }

        if let Err(e) = Self::save_thumbnail(&thumbnail, file) {
            let _ = fs::remove_file(&path);
            return Err(e.context(format!("Failed to save thumbnail of {:?}", source)));
        }

        debug!(?source, thumbnail = ?path, "Generated thumbnail");
        Ok(Generated {
            thumbnail: path,
            deduplicated: None,
        })
    }

    /// Thumbnail dimensions fitting a `bound` x `bound` square, aspect ratio
    /// preserved. Smaller images are not scaled up.
    fn calculate_dimensions(src_width: u32, src_height: u32, bound: u32) -> (u32, u32) {
        if src_width <= bound && src_height <= bound {
            return (src_width.max(1), src_height.max(1));
        }
        let scale = f64::from(bound) / f64::from(src_width.max(src_height));
        let width = (f64::from(src_width) * scale).round() as u32;
        let height = (f64::from(src_height) * scale).round() as u32;
        (width.clamp(1, bound), height.clamp(1, bound))
    }

    fn make_thumbnail(img: DynamicImage, bound: u32) -> DynamicImage {
        let (src_width, src_height) = img.dimensions();
        let (width, height) = Self::calculate_dimensions(src_width, src_height, bound);
        if (width, height) == (src_width, src_height) {
            return img;
        }
        img.resize_exact(width, height, FilterType::Triangle)
    }

    /// Copy an existing thumbnail with identical pixels over `new_file`.
    /// Returns the copied thumbnail, if one was found.
    fn copy_duplicate(&self, hash: &str, thumbnail: &DynamicImage, new_file: &Path) -> Result<Option<PathBuf>> {
        let _guard = self.lock.lock().context("Failed to take the deduplication lock")?;
        let Some(duplicate) = self.find_duplicate(hash, thumbnail, new_file) else {
            return Ok(None);
        };
        fs::copy(&duplicate, new_file).with_context(|| format!("Failed to copy thumbnail {:?}", duplicate))?;
        Ok(Some(duplicate))
    }

    /// An existing thumbnail with the same hash and identical pixels.
    fn find_duplicate(&self, hash: &str, thumbnail: &DynamicImage, new_file: &Path) -> Option<PathBuf> {
        let prefix = format!("{}-", hash);
        let entries = fs::read_dir(&self.dir).ok()?;
        entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path != new_file
                    && !self.deduplicated.contains(path)
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
            })
            .find(|path| match image::open(path) {
                Ok(candidate) => {
                    let candidate = normalize(candidate);
                    candidate.color() == thumbnail.color()
                        && candidate.dimensions() == thumbnail.dimensions()
                        && candidate.as_bytes() == thumbnail.as_bytes()
                }
                Err(_) => false,
            })
    }

    fn save_thumbnail(img: &DynamicImage, file: File) -> Result<()> {
        let mut writer = BufWriter::new(file);
        img.write_to(&mut writer, ImageFormat::Png)
            .context("Failed to encode thumbnail")?;
        writer.flush().context("Failed to write thumbnail")?;
        Ok(())
    }
}

/// 8-bit RGB, or RGBA when the image has an alpha channel.
fn normalize(img: DynamicImage) -> DynamicImage {
    if img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.into_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.into_rgb8())
    }
}

/// Hex digest of raw pixel bytes.
pub fn hash_pixels(bytes: &[u8]) -> String {
    format!("{:016x}", xxh3_64(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailParams {
    pub dir: PathBuf,
    pub size: u32,
}

/// Outcome of one thumbnail job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailResult {
    pub source: PathBuf,
    /// `None` when generation failed.
    pub thumbnail: Option<PathBuf>,
    pub deduplicated: Option<PathBuf>,
}

/// Pool task wrapping [`ThumbnailGenerator`].
pub struct ThumbnailTask {
    generator: ThumbnailGenerator,
}

impl Task for ThumbnailTask {
    type Params = ThumbnailParams;
    type Job = PathBuf;
    type Output = ThumbnailResult;

    const KIND: &'static str = "thumbnail";
    const NAME: &'static str = "GridThumbnailer";

    fn from_params(params: ThumbnailParams, _index: usize) -> Result<Self> {
        Ok(Self {
            generator: ThumbnailGenerator::new(params.dir, params.size)?,
        })
    }

    fn run(&mut self, source: PathBuf, emit: &mut dyn FnMut(ThumbnailResult)) {
        let (thumbnail, deduplicated) = match self.generator.generate(&source) {
            Ok(generated) => (Some(generated.thumbnail), generated.deduplicated),
            Err(e) => {
                debug!(?source, error = %e, "Failed to generate thumbnail");
                (None, None)
            }
        };
        emit(ThumbnailResult {
            source,
            thumbnail,
            deduplicated,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::test_util::write_png;
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    /// A thumbnail directory inside `out`, so its lock file is cleaned up too.
    fn thumbs_dir(out: &TempDir) -> PathBuf {
        let dir = out.path().join("thumbnails");
        fs::create_dir(&dir).unwrap();
        dir
    }

    fn thumb_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
        files.sort();
        files
    }

    #[test]
    fn test_calculate_dimensions_landscape() {
        let (w, h) = ThumbnailGenerator::calculate_dimensions(1920, 1080, 256);
        assert_eq!(w, 256);
        assert_eq!(h, 144);
    }

    #[test]
    fn test_calculate_dimensions_small_source() {
        // Source smaller than the bound - don't upscale
        assert_eq!(ThumbnailGenerator::calculate_dimensions(200, 100, 256), (200, 100));
    }

    #[test]
    fn test_calculate_dimensions_extreme_portrait() {
        let (w, h) = ThumbnailGenerator::calculate_dimensions(10, 5000, 256);
        assert_eq!(h, 256);
        assert_eq!(w, 1);
    }

    #[test]
    fn test_generate_names_file_after_pixel_hash() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let thumbs = thumbs_dir(&out);
        let source = src.path().join("a.png");
        write_png(&source, 1);

        let mut generator = ThumbnailGenerator::new(thumbs.clone(), 32).unwrap();
        let generated = generator.generate(&source).unwrap();
        assert!(generated.deduplicated.is_none());

        let name = generated.thumbnail.file_name().unwrap().to_str().unwrap().to_string();
        let expected = hash_pixels(normalize(image::open(&source).unwrap()).as_bytes());
        assert!(name.starts_with(&format!("{}-", expected)));
        assert!(name.ends_with(".png"));
        assert_eq!(image::open(&generated.thumbnail).unwrap().dimensions(), (4, 4));
    }

    #[test]
    fn test_identical_pixels_are_deduplicated() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let thumbs = thumbs_dir(&out);
        let first = src.path().join("first.png");
        let second = src.path().join("second.png");
        write_png(&first, 9);
        write_png(&second, 9);

        let mut generator = ThumbnailGenerator::new(thumbs.clone(), 32).unwrap();
        let a = generator.generate(&first).unwrap();
        let b = generator.generate(&second).unwrap();
        assert_eq!(b.deduplicated.as_ref(), Some(&a.thumbnail));
        assert_ne!(a.thumbnail, b.thumbnail);

        // Once the cache deletes the duplicate, exactly one file remains.
        fs::remove_file(&a.thumbnail).unwrap();
        assert_eq!(thumb_files(&thumbs), vec![b.thumbnail.clone()]);

        // A reported duplicate is never matched again
        let c = generator.generate(&first).unwrap();
        assert_eq!(c.deduplicated.as_ref(), Some(&b.thumbnail));
    }

    #[test]
    fn test_different_pixels_are_not_deduplicated() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let thumbs = thumbs_dir(&out);
        write_png(&src.path().join("a.png"), 1);
        write_png(&src.path().join("b.png"), 2);

        let mut generator = ThumbnailGenerator::new(thumbs.clone(), 32).unwrap();
        generator.generate(&src.path().join("a.png")).unwrap();
        let b = generator.generate(&src.path().join("b.png")).unwrap();
        assert!(b.deduplicated.is_none());
        assert_eq!(thumb_files(&thumbs).len(), 2);
    }

    #[test]
    fn test_task_reports_failure_without_file() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let thumbs = thumbs_dir(&out);
        let bad = src.path().join("bad.png");
        fs::write(&bad, "not an image").unwrap();

        let mut task = ThumbnailTask::from_params(
            ThumbnailParams {
                dir: thumbs.clone(),
                size: 32,
            },
            0,
        )
        .unwrap();
        let mut results = Vec::new();
        task.run(bad.clone(), &mut |r| results.push(r));
        assert_eq!(
            results,
            vec![ThumbnailResult {
                source: bad,
                thumbnail: None,
                deduplicated: None
            }]
        );
        assert!(thumb_files(&thumbs).is_empty());
    }

    #[test]
    fn test_duplicate_lookup_waits_for_deletion() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let thumbs = thumbs_dir(&out);
        let first = src.path().join("first.png");
        let second = src.path().join("second.png");
        write_png(&first, 9);
        write_png(&second, 9);

        let mut generator = ThumbnailGenerator::new(thumbs.clone(), 32).unwrap();
        let a = generator.generate(&first).unwrap();

        // Hold the lock the way the manager does while deleting `a`
        let lock = DedupLock::open(&thumbs).unwrap();
        let guard = lock.lock().unwrap();
        let handle = thread::spawn(move || generator.generate(&second));
        thread::sleep(Duration::from_millis(300));
        assert!(!handle.is_finished());
        fs::remove_file(&a.thumbnail).unwrap();
        drop(guard);

        let b = handle.join().unwrap().unwrap();
        assert!(b.deduplicated.is_none());
        assert_eq!(thumb_files(&thumbs), vec![b.thumbnail.clone()]);
        assert!(image::open(&b.thumbnail).is_ok());
    }

    #[test]
    fn test_missing_directory_is_rejected() {
        assert!(ThumbnailGenerator::new(PathBuf::from("/nonexistent/thumbs"), 32).is_err());
    }
}
