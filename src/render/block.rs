//! Half-block renderer.
//!
//! Each terminal cell shows two vertically stacked pixels using the upper
//! half block character with truecolour foreground (top pixel) and background
//! (bottom pixel). With the usual 1:2 cell aspect ratio these pixels are
//! roughly square.

use std::fmt::Write as _;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, Frames, ImageFormat, Rgba, RgbaImage};
use tracing::trace;

use super::{Alpha, CellSize, Clearable, Frame, FrameSource, Rendered, Renderer, SizeMode, StyleParams};
use crate::error::RenderError;

const UPPER_HALF: char = '\u{2580}';
const LOWER_HALF: char = '\u{2584}';
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockRenderer;

impl Clearable for BlockRenderer {}

impl Renderer for BlockRenderer {
    fn encode(&self, source: &Path, max_size: CellSize, style: &StyleParams) -> Result<Rendered, RenderError> {
        check_size(max_size)?;
        let img = open_image(source)?;
        Ok(render_image(&img, max_size, style))
    }

    fn animate(
        &self,
        source: &Path,
        max_size: CellSize,
        style: &StyleParams,
        repeat: i32,
    ) -> Result<Box<dyn FrameSource>, RenderError> {
        check_size(max_size)?;
        let bytes = read(source)?;
        if image::guess_format(&bytes).ok() == Some(ImageFormat::Gif) {
            let frames = decode_gif(source, bytes.clone())?;
            return Ok(Box::new(GifFrames {
                path: source.to_path_buf(),
                bytes,
                frames,
                max_size,
                style: *style,
                repeat,
                loops: 0,
                index: 0,
            }));
        }

        let image = decode(source, &bytes)?;
        Ok(Box::new(StillFrame {
            image,
            max_size,
            style: *style,
            done: false,
        }))
    }
}

fn check_size(size: CellSize) -> Result<(), RenderError> {
    if size.is_empty() {
        return Err(RenderError::TooSmall {
            cols: size.cols,
            rows: size.rows,
        });
    }
    Ok(())
}

fn read(path: &Path) -> Result<Vec<u8>, RenderError> {
    std::fs::read(path).map_err(|source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn decode(path: &Path, bytes: &[u8]) -> Result<DynamicImage, RenderError> {
    image::load_from_memory(bytes).map_err(|source| RenderError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

fn decode_gif(path: &Path, bytes: Vec<u8>) -> Result<Frames<'static>, RenderError> {
    GifDecoder::new(Cursor::new(bytes))
        .map(AnimationDecoder::into_frames)
        .map_err(|source| RenderError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// Open an image; animated GIFs yield their first frame.
pub fn open_image(path: &Path) -> Result<DynamicImage, RenderError> {
    let bytes = read(path)?;
    if image::guess_format(&bytes).ok() == Some(ImageFormat::Gif) {
        let mut frames = decode_gif(path, bytes)?;
        return match frames.next() {
            Some(Ok(frame)) => Ok(DynamicImage::ImageRgba8(frame.into_buffer())),
            Some(Err(source)) => Err(RenderError::Decode {
                path: path.to_path_buf(),
                source,
            }),
            None => Err(RenderError::Empty {
                path: path.to_path_buf(),
            }),
        };
    }
    decode(path, &bytes)
}

/// Pixel size of the render: `cols` x `rows * 2` at most, aspect preserved.
pub fn fit_pixels(width: u32, height: u32, max_size: CellSize, mode: SizeMode) -> (u32, u32) {
    let box_w = f64::from(max_size.cols);
    let box_h = f64::from(max_size.rows) * 2.0;
    let (w, h) = (f64::from(width.max(1)), f64::from(height.max(1)));

    let mut scale = (box_w / w).min(box_h / h);
    if mode == SizeMode::Auto {
        scale = scale.min(1.0);
    }
    let pw = ((w * scale).round() as u32).clamp(1, u32::from(max_size.cols));
    let ph = ((h * scale).round() as u32).clamp(1, u32::from(max_size.rows) * 2);
    (pw, ph)
}

/// Render a decoded image within `max_size`.
pub fn render_image(img: &DynamicImage, max_size: CellSize, style: &StyleParams) -> Rendered {
    let (pw, ph) = fit_pixels(img.width(), img.height(), max_size, style.mode);
    let pixels = image::imageops::resize(&img.to_rgba8(), pw, ph, FilterType::Triangle);
    trace!(pw, ph, "Rendering half blocks");
    render_pixels(&pixels, style.alpha)
}

/// Resolve a pixel to an opaque colour, or `None` if transparent.
fn resolve(pixel: &Rgba<u8>, alpha: Alpha) -> Option<[u8; 3]> {
    let [r, g, b, a] = pixel.0;
    match alpha {
        Alpha::Opaque => Some([r, g, b]),
        Alpha::Threshold(t) => (f32::from(a) / 255.0 >= t).then_some([r, g, b]),
        Alpha::Background(bg) => {
            let blend = |c: u8, bg: u8| {
                let a = u16::from(a);
                ((u16::from(c) * a + u16::from(bg) * (255 - a)) / 255) as u8
            };
            Some([blend(r, bg[0]), blend(g, bg[1]), blend(b, bg[2])])
        }
    }
}

fn render_pixels(pixels: &RgbaImage, alpha: Alpha) -> Rendered {
    let (width, height) = pixels.dimensions();
    let rows = height.div_ceil(2);
    let mut text = String::with_capacity((width * rows * 24) as usize);

    for row in 0..rows {
        if row > 0 {
            text.push('\n');
        }
        let y = row * 2;
        for x in 0..width {
            let top = resolve(pixels.get_pixel(x, y), alpha);
            let bottom = if y + 1 < height {
                resolve(pixels.get_pixel(x, y + 1), alpha)
            } else {
                None
            };
            // Writing to a String cannot fail
            let _ = match (top, bottom) {
                (Some([r, g, b]), Some([br, bg, bb])) => {
                    write!(text, "\x1b[38;2;{r};{g};{b};48;2;{br};{bg};{bb}m{UPPER_HALF}")
                }
                (Some([r, g, b]), None) => write!(text, "\x1b[49;38;2;{r};{g};{b}m{UPPER_HALF}"),
                (None, Some([r, g, b])) => write!(text, "\x1b[49;38;2;{r};{g};{b}m{LOWER_HALF}"),
                (None, None) => write!(text, "{RESET} "),
            };
        }
        text.push_str(RESET);
    }

    Rendered {
        text,
        size: CellSize::new(width as u16, rows as u16),
    }
}

/// Frames of an animated GIF, re-decoded from memory for every loop.
struct GifFrames {
    path: PathBuf,
    bytes: Vec<u8>,
    frames: Frames<'static>,
    max_size: CellSize,
    style: StyleParams,
    repeat: i32,
    loops: i32,
    index: usize,
}

impl FrameSource for GifFrames {
    fn next_frame(&mut self) -> Option<Result<Frame, RenderError>> {
        loop {
            match self.frames.next() {
                Some(Ok(frame)) => {
                    let delay = frame.delay().into();
                    let img = DynamicImage::ImageRgba8(frame.into_buffer());
                    let rendered = render_image(&img, self.max_size, &self.style);
                    let index = self.index;
                    self.index += 1;
                    return Some(Ok(Frame {
                        rendered,
                        index,
                        delay,
                    }));
                }
                Some(Err(source)) => {
                    return Some(Err(RenderError::Decode {
                        path: self.path.clone(),
                        source,
                    }))
                }
                None => {
                    if self.index == 0 {
                        return Some(Err(RenderError::Empty {
                            path: self.path.clone(),
                        }));
                    }
                    self.loops += 1;
                    if self.repeat >= 0 && self.loops >= self.repeat {
                        return None;
                    }
                    match decode_gif(&self.path, self.bytes.clone()) {
                        Ok(frames) => self.frames = frames,
                        Err(e) => return Some(Err(e)),
                    }
                    self.index = 0;
                }
            }
        }
    }

    fn set_max_size(&mut self, size: CellSize) {
        self.max_size = size;
    }
}

/// A non-animated image played as a single frame.
struct StillFrame {
    image: DynamicImage,
    max_size: CellSize,
    style: StyleParams,
    done: bool,
}

impl FrameSource for StillFrame {
    fn next_frame(&mut self) -> Option<Result<Frame, RenderError>> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(Ok(Frame {
            rendered: render_image(&self.image, self.max_size, &self.style),
            index: 0,
            delay: std::time::Duration::ZERO,
        }))
    }

    fn set_max_size(&mut self, size: CellSize) {
        self.max_size = size;
    }
}
