//! User configuration.
//!
//! Options are read from `<XDG config dir>/termview/config.json` (or an explicit
//! path). Every option has a default, so a missing file or a partial file is
//! fine; invalid values are rejected by [`Config::validate`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::render::CellSize;

/// Name of the config file inside the config directory.
const CONFIG_FILE: &str = "config.json";

/// Smallest accepted thumbnail size in pixels.
const MIN_THUMBNAIL_SIZE: u32 = 32;

/// Largest accepted thumbnail size in pixels.
const MAX_THUMBNAIL_SIZE: u32 = 512;

/// Grid cell width bounds, in columns.
const MIN_CELL_WIDTH: u16 = 10;
const MAX_CELL_WIDTH: u16 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Scan sub-directories.
    pub recursive: bool,
    /// Include hidden (dot) entries.
    pub show_hidden: bool,
    /// Maximum directory recursion depth below a root.
    pub max_depth: usize,
    /// Number of directory checkers. `None` means one per CPU.
    pub checkers: Option<usize>,
    /// Run workers in child processes when possible.
    pub multi: bool,
    /// Number of grid cell renderers.
    pub grid_renderers: usize,
    /// Render grid cells from cached thumbnails.
    pub thumbnail: bool,
    /// Thumbnail bounding square, in pixels.
    pub thumbnail_size: u32,
    /// Maximum number of sources mapped in the thumbnail cache. 0 = unbounded.
    pub thumbnail_cache: usize,
    /// Grid cell width in columns.
    pub cell_width: u16,
    /// Maximum number of rendered grid cells kept in memory.
    pub grid_cache: usize,
    /// Number of times an animation is played. -1 = forever.
    pub repeat: i32,
    /// Fixed frame duration in seconds, overriding the image's own delays.
    pub frame_duration: Option<f64>,
    /// Images with more pixels than this are not animated. 0 = unlimited.
    pub max_pixels: u64,
    /// Write logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,
    /// Verbose logging.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recursive: false,
            show_hidden: false,
            max_depth: 50,
            checkers: None,
            multi: true,
            grid_renderers: 1,
            thumbnail: true,
            thumbnail_size: 256,
            thumbnail_cache: 0,
            cell_width: 30,
            grid_cache: 512,
            repeat: -1,
            frame_duration: None,
            max_pixels: 0,
            log_file: None,
            debug: false,
        }
    }
}

impl Config {
    /// Load the config from `path`, or from the default location if `None`.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            debug!(?path, "No config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_json(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.clone(),
                source,
            },
            other => other,
        })?;

        debug!(?path, "Loaded config");
        Ok(config)
    }

    /// Parse and validate a JSON config document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = ProjectDirs::from("", "", "termview").ok_or(ConfigError::NoConfigDir)?;
        Ok(proj_dirs.config_dir().join(CONFIG_FILE))
    }

    /// Check every option against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid {
                option: "max-depth",
                reason: "must be greater than zero",
            });
        }
        if !(MIN_THUMBNAIL_SIZE..=MAX_THUMBNAIL_SIZE).contains(&self.thumbnail_size) {
            return Err(ConfigError::Invalid {
                option: "thumbnail-size",
                reason: "must be an integer between 32 and 512 (both inclusive)",
            });
        }
        if !(MIN_CELL_WIDTH..=MAX_CELL_WIDTH).contains(&self.cell_width) || self.cell_width % 2 != 0
        {
            return Err(ConfigError::Invalid {
                option: "cell-width",
                reason: "must be an even integer between 10 and 50 (both inclusive)",
            });
        }
        if self.grid_cache == 0 {
            return Err(ConfigError::Invalid {
                option: "grid-cache",
                reason: "must be greater than zero",
            });
        }
        if self.repeat == 0 || self.repeat < -1 {
            return Err(ConfigError::Invalid {
                option: "repeat",
                reason: "must be -1 or a positive integer",
            });
        }
        if matches!(self.frame_duration, Some(d) if !(d > 0.0 && d.is_finite())) {
            return Err(ConfigError::Invalid {
                option: "frame-duration",
                reason: "must be `null` or a positive number of seconds",
            });
        }
        Ok(())
    }

    /// Number of directory checkers to run.
    pub fn checker_count(&self) -> usize {
        self.checkers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Number of grid cell renderers to run (at least one).
    pub fn grid_renderer_count(&self) -> usize {
        self.grid_renderers.max(1)
    }

    /// Canvas available to a single grid cell, inside its border.
    pub fn grid_canvas(&self) -> CellSize {
        CellSize::new(self.cell_width - 2, self.cell_width / 2 - 2)
    }

    /// Frame duration override, if any.
    pub fn frame_duration(&self) -> Option<Duration> {
        self.frame_duration.map(Duration::from_secs_f64)
    }
}
