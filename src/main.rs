use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use termview::config::Config;
use termview::executor::Executor;
use termview::render::{BlockRenderer, CellSize, Renderer, StyleParams};
use termview::scanner::directory::DirectoryScanner;

/// Browse images in the terminal.
#[derive(Parser, Debug)]
#[command(name = "termview", version)]
struct Cli {
    /// Image files to render, or directories to scan for images
    #[arg(required_unless_present = "worker")]
    paths: Vec<PathBuf>,

    /// Scan sub-directories
    #[arg(short, long)]
    recursive: bool,

    /// Include hidden entries
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Maximum recursion depth
    #[arg(long)]
    max_depth: Option<usize>,

    /// Number of directory checkers (0 or 1 for a serial scan)
    #[arg(long)]
    checkers: Option<usize>,

    /// Config file to use instead of the default one
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run all workers as threads of this process
    #[arg(long)]
    no_multi: bool,

    /// Columns available to a rendered image
    #[arg(long, default_value_t = 80)]
    cols: u16,

    /// Rows available to a rendered image
    #[arg(long, default_value_t = 24)]
    rows: u16,

    /// Serve one pool worker over stdin/stdout
    #[arg(long, num_args = 2, value_names = ["KIND", "INDEX"], hide = true)]
    worker: Option<Vec<String>>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        config.recursive |= self.recursive;
        config.show_hidden |= self.all;
        if let Some(max_depth) = self.max_depth {
            config.max_depth = max_depth;
        }
        if self.checkers.is_some() {
            config.checkers = self.checkers;
        }
        if self.no_multi {
            config.multi = false;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("termview: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    cli.apply(&mut config);
    config.validate()?;
    termview::logging::init(&config)?;

    if let Some(worker) = &cli.worker {
        let [kind, index] = worker.as_slice() else {
            anyhow::bail!("--worker takes a kind and an index");
        };
        let index = index.parse().context("Invalid worker index")?;
        return termview::serve_worker(kind, index);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
    runtime.block_on(browse(config, cli.paths, CellSize::new(cli.cols, cli.rows)))
}

async fn browse(config: Config, paths: Vec<PathBuf>, size: CellSize) -> Result<()> {
    let (dirs, files): (Vec<PathBuf>, Vec<PathBuf>) = paths.into_iter().partition(|p| p.is_dir());

    for file in &files {
        match BlockRenderer.encode(file, size, &StyleParams::default()) {
            Ok(rendered) => println!("{}", rendered.text),
            Err(e) => warn!(path = ?file, error = %e, "Failed to render image"),
        }
    }

    if dirs.is_empty() {
        return Ok(());
    }

    let executor = Arc::new(Executor::from_config(&config));
    info!(executor = executor.describe(), "Scanning {} directories", dirs.len());
    let scanner = DirectoryScanner::from_config(&config, executor);
    let report = scanner.scan_async(dirs.clone()).await?;

    for dir in &dirs {
        match report.tree(dir) {
            Some(tree) => println!("{}: {}", dir.display(), tree.to_json()),
            None => info!(?dir, "No images found"),
        }
    }
    if report.errors > 0 {
        warn!(errors = report.errors, "Some directories could not be read");
    }
    Ok(())
}
