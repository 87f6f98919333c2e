//! Content discovery.
//!
//! - [`directory`] finds which directories (transitively) contain images
//! - [`entries`] streams the displayable entries of one directory
//! - [`tree`] is the content tree shared between the two

pub mod directory;
pub mod entries;
pub mod tree;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use image::{ImageError, ImageReader};

pub use directory::{DirectoryScanner, ScanOptions, ScanReport, ScanSession};
pub use entries::{Entry, EntryEvent, EntryKind, EntryScanner};
pub use tree::ContentTree;

/// Result of probing a file for image content.
#[derive(Debug, PartialEq, Eq)]
pub enum Probe {
    /// A recognised image whose header decodes.
    Image,
    /// Not an image format we know.
    Unknown,
    /// Looks like an image but could not be read.
    Unreadable(String),
}

impl Probe {
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image)
    }
}

/// Probe a file by content (the extension is ignored).
///
/// Only the header is decoded, so this is cheap even for large images.
pub fn probe_image(path: &Path) -> Probe {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => return Probe::Unreadable(e.to_string()),
    };
    let reader = match ImageReader::new(BufReader::new(file)).with_guessed_format() {
        Ok(r) => r,
        Err(e) => return Probe::Unreadable(e.to_string()),
    };
    if reader.format().is_none() {
        return Probe::Unknown;
    }
    match reader.into_dimensions() {
        Ok(_) => Probe::Image,
        Err(ImageError::Unsupported(_)) => Probe::Unknown,
        Err(e) => Probe::Unreadable(e.to_string()),
    }
}

/// Whether a file name denotes a hidden entry.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::path::Path;

    /// Write a small valid PNG.
    pub fn write_png(path: &Path, shade: u8) {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([shade, 64, 128]));
        img.save_with_format(path, image::ImageFormat::Png).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_probe_by_content() {
        let dir = tempdir().unwrap();
        let png = dir.path().join("no_extension");
        test_util::write_png(&png, 10);
        assert_eq!(probe_image(&png), Probe::Image);

        let text = dir.path().join("notes.png");
        std::fs::write(&text, "not an image").unwrap();
        assert_eq!(probe_image(&text), Probe::Unknown);
    }

    #[test]
    fn test_probe_truncated_image_is_unreadable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.png");
        // PNG signature followed by garbage
        std::fs::write(&path, b"\x89PNG\r\n\x1a\n\0\0\0\0garbage").unwrap();
        assert!(matches!(probe_image(&path), Probe::Unreadable(_)));
    }

    #[test]
    fn test_probe_missing_file() {
        assert!(matches!(
            probe_image(Path::new("/nonexistent/file.png")),
            Probe::Unreadable(_)
        ));
    }

    #[test]
    fn test_is_hidden() {
        assert!(is_hidden(".git"));
        assert!(!is_hidden("photo.png"));
    }
}
