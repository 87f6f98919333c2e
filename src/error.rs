//! Error types for termview.
//!
//! Each subsystem gets its own enum so that the orchestrator can decide per
//! subsystem whether a failure disables it or ends the session.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An option has a value outside its allowed range.
    #[error("Invalid value for '{option}': {reason}")]
    Invalid {
        option: &'static str,
        reason: &'static str,
    },

    /// The config file could not be read.
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for `Config`.
    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// No config directory could be determined for this platform.
    #[error("Failed to determine project directories")]
    NoConfigDir,
}

/// Errors raised by a renderer while turning an image into terminal output.
#[derive(Error, Debug)]
pub enum RenderError {
    /// The source could not be read.
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The source could not be decoded.
    #[error("Failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The source decoded to an image with no pixels or no frames.
    #[error("{path:?} has no displayable content")]
    Empty { path: PathBuf },

    /// A zero-sized render area was requested.
    #[error("Render size {cols}x{rows} is too small")]
    TooSmall { cols: u16, rows: u16 },
}

/// Directory scanning errors.
///
/// Per-directory I/O failures never surface here; they are logged and the
/// offending path is skipped.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Every checker worker died before the scan could complete.
    #[error("All checkers were terminated, checking directory sources failed")]
    AllCheckersFailed,

    /// Workers could not be started.
    #[error("Failed to start checkers: {0}")]
    Executor(#[from] ExecutorError),

    /// The blocking scan task panicked.
    #[error("Scan task panicked")]
    Panicked,
}

/// Thumbnail subsystem errors. Any of these disables thumbnailing for the
/// session; grid cells are then rendered from the full-size sources.
#[derive(Error, Debug)]
pub enum ThumbnailError {
    /// The per-session temporary directory could not be created.
    #[error("Failed to create the temporary data directory: {0}")]
    TempDir(#[source] std::io::Error),

    /// The thumbnail directory could not be created.
    #[error("Failed to create the thumbnail directory {path:?}: {source}")]
    ThumbnailDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The thumbnailer worker could not be started.
    #[error("Failed to start the thumbnailer: {0}")]
    Executor(#[from] ExecutorError),
}

/// Worker executor errors.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// A worker thread could not be spawned.
    #[error("Failed to spawn worker thread '{name}': {source}")]
    Thread {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker process could not be spawned.
    #[error("Failed to spawn worker process '{name}': {source}")]
    Process {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Task parameters could not be encoded for a worker process.
    #[error("Failed to encode parameters for '{name}': {source}")]
    Params {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// A child was started with a task kind it does not know.
    #[error("Unknown worker kind '{0}'")]
    UnknownKind(String),
}
