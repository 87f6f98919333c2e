//! Directory scanner.
//!
//! Given one or more root directories, determines which sub-directories
//! (transitively) contain images and produces a [`ContentTree`] per root.
//!
//! - Symlinked directories are followed, symlink cycles are skipped
//! - Non-recursive scans stop at the first image found in a directory
//! - With more than one checker, every sub-directory becomes a separate job
//!   and the orchestrator merges the partial trees; a checker that dies has
//!   its in-progress job requeued

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{debug, error, info, trace, warn};
use walkdir::WalkDir;

use super::tree::ContentTree;
use super::{is_hidden, probe_image};
use crate::config::Config;
use crate::error::ScanError;
use crate::executor::{Executor, Task};
use crate::pool::WorkQueuePool;

/// How often the orchestrator checks checker liveness while idle.
const LIVENESS_INTERVAL: Duration = Duration::from_millis(50);

/// Scan behaviour shared by every checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    pub recursive: bool,
    pub show_hidden: bool,
    /// Sub-directories deeper than this below a root are not visited.
    pub max_depth: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            show_hidden: false,
            max_depth: 50,
        }
    }
}

impl From<&Config> for ScanOptions {
    fn from(config: &Config) -> Self {
        Self {
            recursive: config.recursive,
            show_hidden: config.show_hidden,
            max_depth: config.max_depth,
        }
    }
}

/// A symlink followed on the way to a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Canonical location of the link itself.
    pub link: PathBuf,
    /// Canonical target of the link.
    pub resolved: PathBuf,
}

/// One directory to check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJob {
    /// Root the directory belongs to.
    pub root: PathBuf,
    /// Symlinks followed from the root to `target`.
    pub chain: Vec<Link>,
    /// Directory path as reached from the root (symlinks not resolved).
    pub target: PathBuf,
    /// Depth below the root, 0 for the root itself.
    pub depth: usize,
}

impl ScanJob {
    /// Job for a root directory.
    ///
    /// Relative roots are made absolute against the current directory.
    pub fn root(root: &Path) -> Self {
        let root = absolute(root);
        let chain = match fs::symlink_metadata(&root) {
            Ok(meta) if meta.file_type().is_symlink() => fs::canonicalize(&root)
                .map(|resolved| {
                    vec![Link {
                        link: root.clone(),
                        resolved,
                    }]
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Self {
            target: root.clone(),
            root,
            chain,
            depth: 0,
        }
    }
}

/// Path components of `target` below `root`.
fn relative_components(root: &Path, target: &Path) -> Vec<String> {
    target
        .strip_prefix(root)
        .map(|rel| {
            rel.components()
                .filter_map(|c| match c {
                    Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Whether following a link to `resolved` from `current` (canonical) would
/// loop back into a directory already on the path.
fn is_cycle(current: &Path, chain: &[Link], resolved: &Path) -> bool {
    current.starts_with(resolved)
        || chain
            .iter()
            .any(|l| l.link.starts_with(resolved) || l.resolved.starts_with(resolved))
}

/// List the immediate entries of a directory without following symlinks.
fn list_dir(dir: &Path) -> Result<Vec<walkdir::DirEntry>, walkdir::Error> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        match entry {
            Ok(entry) => entries.push(entry),
            Err(e) if e.depth() == 0 => return Err(e),
            Err(e) => trace!(error = %e, "Skipping unreadable entry"),
        }
    }
    Ok(entries)
}

/// Checks a directory, recursing or branching into its sub-directories.
pub(crate) struct DirChecker<'a> {
    options: &'a ScanOptions,
    root: &'a Path,
    /// When set, sub-directories are handed here instead of being recursed into.
    branch: Option<&'a mut dyn FnMut(ScanJob)>,
    cancel: Option<&'a AtomicBool>,
    errors: usize,
}

impl<'a> DirChecker<'a> {
    pub(crate) fn new(options: &'a ScanOptions, root: &'a Path) -> Self {
        Self {
            options,
            root,
            branch: None,
            cancel: None,
            errors: 0,
        }
    }

    pub(crate) fn branching(mut self, branch: &'a mut dyn FnMut(ScanJob)) -> Self {
        self.branch = Some(branch);
        self
    }

    pub(crate) fn cancellable(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Number of directories that could not be read.
    pub(crate) fn errors(&self) -> usize {
        self.errors
    }

    /// Content tree of `dir`, or `None` if it has no image anywhere below it.
    pub(crate) fn check(&mut self, dir: &Path, depth: usize, chain: &mut Vec<Link>) -> Option<ContentTree> {
        if self.cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return None;
        }

        let real = match fs::canonicalize(dir) {
            Ok(real) => real,
            Err(e) => {
                warn!(?dir, error = %e, "Could not access directory");
                self.errors += 1;
                return None;
            }
        };
        let entries = match list_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(?dir, error = %e, "Could not get the contents of directory");
                self.errors += 1;
                return None;
            }
        };

        let mut tree = ContentTree::new();
        let mut found_image = false;

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.options.show_hidden && is_hidden(&name) {
                continue;
            }
            let path = entry.path();
            // Follows symlinks
            let Ok(meta) = fs::metadata(path) else { continue };

            if meta.is_file() {
                if !found_image && probe_image(path).is_image() {
                    found_image = true;
                    if !self.options.recursive {
                        break;
                    }
                }
            } else if self.options.recursive && meta.is_dir() {
                if depth >= self.options.max_depth {
                    // Only images matter at the depth limit
                    if found_image {
                        break;
                    }
                    continue;
                }

                let link = if entry.path_is_symlink() {
                    let Ok(resolved) = fs::canonicalize(path) else { continue };
                    if is_cycle(&real, chain, &resolved) {
                        debug!(?path, ?resolved, "Skipping symlink cycle");
                        continue;
                    }
                    Some(Link {
                        link: real.join(entry.file_name()),
                        resolved,
                    })
                } else {
                    None
                };

                if let Some(branch) = self.branch.as_mut() {
                    let mut sub_chain = chain.clone();
                    sub_chain.extend(link);
                    branch(ScanJob {
                        root: self.root.to_path_buf(),
                        chain: sub_chain,
                        target: path.to_path_buf(),
                        depth: depth + 1,
                    });
                    continue;
                }

                let followed = link.is_some();
                chain.extend(link);
                let subtree = self.check(path, depth + 1, chain);
                if followed {
                    chain.pop();
                }
                if let Some(subtree) = subtree {
                    tree.insert_dir(name, subtree);
                }
            }
        }

        tree.set_has_images(found_image);
        (!tree.is_empty()).then_some(tree)
    }
}

/// Messages from a checker to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScanEvent {
    /// A sub-directory to be checked as a separate job.
    Branch(ScanJob),
    /// A checker finished a job.
    Finished {
        root: PathBuf,
        target: PathBuf,
        tree: Option<ContentTree>,
        errors: usize,
    },
}

/// Pool task for parallel scans.
pub struct DirTask {
    options: ScanOptions,
}

impl Task for DirTask {
    type Params = ScanOptions;
    type Job = ScanJob;
    type Output = ScanEvent;

    const KIND: &'static str = "checker";
    const NAME: &'static str = "Checker";

    fn from_params(options: ScanOptions, _index: usize) -> anyhow::Result<Self> {
        Ok(Self { options })
    }

    fn run(&mut self, job: ScanJob, emit: &mut dyn FnMut(ScanEvent)) {
        let mut chain = job.chain.clone();
        let (tree, errors) = {
            let mut branch = |sub: ScanJob| emit(ScanEvent::Branch(sub));
            let mut checker = DirChecker::new(&self.options, &job.root).branching(&mut branch);
            let tree = checker.check(&job.target, job.depth, &mut chain);
            (tree, checker.errors())
        };

        emit(ScanEvent::Finished {
            root: job.root,
            target: job.target,
            tree,
            errors,
        });
    }
}

/// Outcome of a scan.
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    /// Roots with content, in submission order.
    pub contents: Vec<(PathBuf, ContentTree)>,
    /// Roots without any image below them.
    pub empty: Vec<PathBuf>,
    /// Directories that could not be read.
    pub errors: usize,
    /// Whether the scan was cancelled before completion.
    pub cancelled: bool,
}

impl ScanReport {
    pub fn tree(&self, root: &Path) -> Option<&ContentTree> {
        self.contents
            .iter()
            .find(|(r, _)| r == root)
            .map(|(_, tree)| tree)
    }

    fn from_trees(roots: Vec<PathBuf>, mut trees: HashMap<PathBuf, ContentTree>) -> Self {
        let mut report = Self::default();
        for root in roots {
            match trees.remove(&root) {
                Some(tree) if !tree.is_empty() => report.contents.push((root, tree)),
                _ => report.empty.push(root),
            }
        }
        report
    }
}

/// Scans directory sources for image content.
#[derive(Clone)]
pub struct DirectoryScanner {
    options: ScanOptions,
    checkers: usize,
    executor: Arc<Executor>,
}

impl DirectoryScanner {
    /// `checkers` of 0 or 1 selects an in-line serial scan.
    pub fn new(options: ScanOptions, checkers: usize, executor: Arc<Executor>) -> Self {
        Self {
            options,
            checkers,
            executor,
        }
    }

    pub fn from_config(config: &Config, executor: Arc<Executor>) -> Self {
        Self::new(ScanOptions::from(config), config.checker_count(), executor)
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Start a session that accepts roots until [`ScanSession::finish_sources`].
    pub fn start(&self) -> ScanSession {
        let (control_tx, control_rx) = flume::unbounded();
        ScanSession {
            scanner: self.clone(),
            control_tx,
            control_rx,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Scan `roots` to completion.
    pub fn scan(&self, roots: &[PathBuf]) -> Result<ScanReport, ScanError> {
        let session = self.start();
        for root in roots {
            session.submit(root);
        }
        session.finish_sources();
        session.wait()
    }

    /// Scan on the blocking thread pool.
    pub async fn scan_async(&self, roots: Vec<PathBuf>) -> Result<ScanReport, ScanError> {
        let scanner = self.clone();
        task::spawn_blocking(move || scanner.scan(&roots))
            .await
            .map_err(|_| ScanError::Panicked)?
    }
}

enum Control {
    Root(PathBuf),
    SourcesFinished,
}

/// Feeds roots into a running scan from any thread.
#[derive(Clone)]
pub struct ScanSubmitter {
    control_tx: Sender<Control>,
    cancel: Arc<AtomicBool>,
}

impl ScanSubmitter {
    pub fn submit(&self, root: &Path) {
        let _ = self.control_tx.send(Control::Root(root.to_path_buf()));
    }

    /// No more roots will be submitted.
    pub fn finish_sources(&self) {
        let _ = self.control_tx.send(Control::SourcesFinished);
    }

    /// Stop starting new directories. Checks already running finish.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// A scan in progress. [`ScanSession::wait`] drives it to completion.
pub struct ScanSession {
    scanner: DirectoryScanner,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    cancel: Arc<AtomicBool>,
}

impl ScanSession {
    pub fn submitter(&self) -> ScanSubmitter {
        ScanSubmitter {
            control_tx: self.control_tx.clone(),
            cancel: Arc::clone(&self.cancel),
        }
    }

    pub fn submit(&self, root: &Path) {
        self.submitter().submit(root);
    }

    pub fn finish_sources(&self) {
        self.submitter().finish_sources();
    }

    pub fn cancel(&self) {
        self.submitter().cancel();
    }

    /// Run until every submitted root is fully checked.
    pub fn wait(self) -> Result<ScanReport, ScanError> {
        let report = if self.scanner.checkers > 1 {
            self.run_parallel()?
        } else {
            self.run_serial()
        };
        info!(
            with_content = report.contents.len(),
            empty = report.empty.len(),
            errors = report.errors,
            cancelled = report.cancelled,
            "Directory scan finished"
        );
        Ok(report)
    }

    fn run_serial(&self) -> ScanReport {
        let mut roots = Vec::new();
        let mut trees = HashMap::new();
        let mut errors = 0;

        for control in self.control_rx.iter() {
            let root = match control {
                Control::Root(root) => root,
                Control::SourcesFinished => break,
            };
            if self.cancel.load(Ordering::Relaxed) {
                continue;
            }
            let job = ScanJob::root(&root);
            debug!(root = ?job.root, "Checking directory source");

            let mut chain = job.chain.clone();
            let mut checker = DirChecker::new(&self.scanner.options, &job.root).cancellable(&self.cancel);
            if let Some(tree) = checker.check(&job.target, 0, &mut chain) {
                trees
                    .entry(job.root.clone())
                    .or_insert_with(ContentTree::new)
                    .merge(tree);
            }
            errors += checker.errors();
            roots.push(job.root);
        }

        let mut report = ScanReport::from_trees(roots, trees);
        report.errors = errors;
        report.cancelled = self.cancel.load(Ordering::Relaxed);
        report
    }

    fn run_parallel(&self) -> Result<ScanReport, ScanError> {
        let num_checkers = self.scanner.checkers;
        let pool = WorkQueuePool::<DirTask>::new(
            &self.scanner.executor,
            num_checkers,
            self.scanner.options.clone(),
        )?;

        let mut roots = Vec::new();
        let mut trees: HashMap<PathBuf, ContentTree> = HashMap::new();
        let mut outstanding = 0usize;
        let mut sources_finished = false;
        let mut cancelled = false;
        let mut errors = 0;

        enum Wake {
            Control(Control),
            Event(ScanEvent),
            Closed,
        }

        loop {
            if !cancelled && self.cancel.load(Ordering::Relaxed) {
                cancelled = true;
                outstanding -= pool.purge_jobs();
                debug!("Directory scan cancelled");
            }
            if outstanding == 0 && (sources_finished || cancelled) {
                break;
            }

            let wake = flume::Selector::new()
                .recv(&self.control_rx, |r| r.map_or(Wake::Closed, Wake::Control))
                .recv(pool.results(), |r| r.map_or(Wake::Closed, Wake::Event))
                .wait_timeout(LIVENESS_INTERVAL);

            match wake {
                Ok(Wake::Control(Control::Root(root))) => {
                    if cancelled {
                        continue;
                    }
                    let job = ScanJob::root(&root);
                    debug!(root = ?job.root, "Checking directory source");
                    roots.push(job.root.clone());
                    outstanding += 1;
                    pool.submit(job);
                }
                Ok(Wake::Control(Control::SourcesFinished)) => sources_finished = true,
                Ok(Wake::Event(event)) => {
                    handle_event(
                        event,
                        &pool,
                        cancelled,
                        &mut trees,
                        &mut outstanding,
                        &mut errors,
                    );
                }
                // The session itself holds a control sender, so only the
                // result queue can close (all checkers gone). A checker that
                // dies mid-job has that job requeued by its executor, so
                // survivors pick it up without help from here.
                Ok(Wake::Closed) | Err(_) => {
                    if pool.alive_count() == 0 {
                        // Collect anything a checker sent before dying.
                        while let Ok(event) = pool.try_recv() {
                            handle_event(
                                event,
                                &pool,
                                cancelled,
                                        &mut trees,
                                &mut outstanding,
                                &mut errors,
                            );
                        }
                        if outstanding == 0 && (sources_finished || cancelled) {
                            break;
                        }
                        error!("All checkers were terminated, checking directory sources failed");
                        return Err(ScanError::AllCheckersFailed);
                    }
                }
            }
        }

        let mut report = ScanReport::from_trees(roots, trees);
        report.errors = errors;
        report.cancelled = cancelled;
        Ok(report)
    }
}

fn handle_event(
    event: ScanEvent,
    pool: &WorkQueuePool<DirTask>,
    cancelled: bool,
    trees: &mut HashMap<PathBuf, ContentTree>,
    outstanding: &mut usize,
    errors: &mut usize,
) {
    match event {
        ScanEvent::Branch(job) => {
            if !cancelled {
                *outstanding += 1;
                pool.submit(job);
            }
        }
        ScanEvent::Finished {
            root,
            target,
            tree,
            errors: job_errors,
        } => {
            *outstanding = outstanding.saturating_sub(1);
            *errors += job_errors;
            if let Some(tree) = tree {
                let components = relative_components(&root, &target);
                trees
                    .entry(root)
                    .or_insert_with(ContentTree::new)
                    .insert_at(&components, tree);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ProcessExecutor;
    use crate::scanner::test_util::write_png;
    use serde_json::json;
    use tempfile::tempdir;

    fn serial(options: ScanOptions) -> DirectoryScanner {
        DirectoryScanner::new(options, 1, Arc::new(Executor::threads()))
    }

    fn parallel(options: ScanOptions, checkers: usize) -> DirectoryScanner {
        DirectoryScanner::new(options, checkers, Arc::new(Executor::threads()))
    }

    fn recursive() -> ScanOptions {
        ScanOptions {
            recursive: true,
            show_hidden: false,
            max_depth: 50,
        }
    }

    fn scan_one(scanner: &DirectoryScanner, root: &Path) -> serde_json::Value {
        let report = scanner.scan(&[root.to_path_buf()]).unwrap();
        report
            .tree(root)
            .map(ContentTree::to_json)
            .unwrap_or_else(|| json!({}))
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_is_skipped() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        fs::create_dir_all(a.join("c")).unwrap();
        write_png(&a.join("img.png"), 1);
        write_png(&a.join("c").join("x.png"), 2);
        std::os::unix::fs::symlink(&a, a.join("b")).unwrap();

        let expected = json!({"/": true, "c": {"/": true}});
        assert_eq!(scan_one(&serial(recursive()), &a), expected);
        assert_eq!(scan_one(&parallel(recursive(), 3), &a), expected);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_to_sibling_is_followed() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let other = dir.path().join("other");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&other).unwrap();
        write_png(&other.join("o.png"), 3);
        std::os::unix::fs::symlink(&other, root.join("link")).unwrap();
        // A link back up from inside the followed target
        std::os::unix::fs::symlink(&root, other.join("back")).unwrap();

        let expected = json!({"link": {"/": true}});
        assert_eq!(scan_one(&serial(recursive()), &root), expected);
        assert_eq!(scan_one(&parallel(recursive(), 2), &root), expected);
    }

    #[test]
    fn test_directories_without_images_are_absent() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("docs/deeper")).unwrap();
        fs::write(root.join("docs/readme.txt"), "text").unwrap();
        fs::create_dir_all(root.join("pics/2024")).unwrap();
        write_png(&root.join("pics/2024/a.png"), 4);

        let expected = json!({"pics": {"2024": {"/": true}}});
        assert_eq!(scan_one(&serial(recursive()), root), expected);
        assert_eq!(scan_one(&parallel(recursive(), 4), root), expected);
    }

    #[test]
    fn test_hidden_entries_respect_option() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join(".secret")).unwrap();
        write_png(&root.join(".secret/a.png"), 5);
        write_png(&root.join(".hidden.png"), 6);

        assert_eq!(scan_one(&serial(recursive()), root), json!({}));

        let options = ScanOptions {
            show_hidden: true,
            ..recursive()
        };
        assert_eq!(
            scan_one(&serial(options), root),
            json!({"/": true, ".secret": {"/": true}})
        );
    }

    #[test]
    fn test_non_recursive_only_checks_root() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        write_png(&root.join("sub/a.png"), 7);

        let options = ScanOptions {
            recursive: false,
            ..recursive()
        };
        let report = serial(options.clone()).scan(&[root.to_path_buf()]).unwrap();
        assert!(report.contents.is_empty());
        assert_eq!(report.empty, vec![root.to_path_buf()]);

        write_png(&root.join("top.png"), 8);
        assert_eq!(scan_one(&serial(options), root), json!({"/": true}));
    }

    #[test]
    fn test_max_depth_limits_descent() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("one/two")).unwrap();
        write_png(&root.join("one/a.png"), 9);
        write_png(&root.join("one/two/b.png"), 10);

        let options = ScanOptions {
            max_depth: 1,
            ..recursive()
        };
        let expected = json!({"one": {"/": true}});
        assert_eq!(scan_one(&serial(options.clone()), root), expected);
        assert_eq!(scan_one(&parallel(options, 2), root), expected);
    }

    #[test]
    fn test_parallel_matches_serial_on_wide_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for i in 0..6 {
            for j in 0..3 {
                let sub = root.join(format!("d{}", i)).join(format!("e{}", j));
                fs::create_dir_all(&sub).unwrap();
                if (i + j) % 2 == 0 {
                    write_png(&sub.join("p.png"), (i * 3 + j) as u8);
                }
            }
        }

        let serial_tree = scan_one(&serial(recursive()), root);
        let parallel_tree = scan_one(&parallel(recursive(), 4), root);
        assert_eq!(serial_tree, parallel_tree);
        assert_eq!(serial_tree["d0"], json!({"e0": {"/": true}, "e2": {"/": true}}));
    }

    #[test]
    fn test_multiple_roots_reported_in_order() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        write_png(&second.path().join("a.png"), 11);

        let roots = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let report = parallel(recursive(), 2).scan(&roots).unwrap();
        assert_eq!(report.empty, vec![first.path().to_path_buf()]);
        assert_eq!(report.contents.len(), 1);
        assert_eq!(report.contents[0].0, second.path());
    }

    #[test]
    fn test_unreadable_root_is_counted() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        let report = serial(recursive()).scan(&[missing.clone()]).unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.empty, vec![missing]);
    }

    #[test]
    fn test_cancelled_scan_reports_cancellation() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 12);

        let session = serial(recursive()).start();
        session.cancel();
        session.submit(dir.path());
        session.finish_sources();
        let report = session.wait().unwrap();
        assert!(report.cancelled);
        assert!(report.contents.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_all_checkers_dying_fails_the_scan() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 14);

        // Every checker takes one job and dies without finishing it
        let executor = ProcessExecutor::new("sh", ["-c", "read p; read j; exit 1", "sh"]);
        let scanner = DirectoryScanner::new(recursive(), 2, Arc::new(Executor::Processes(executor)));
        let result = scanner.scan(&[dir.path().to_path_buf()]);
        assert!(matches!(result, Err(ScanError::AllCheckersFailed)));
    }

    #[tokio::test]
    async fn test_scan_async() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 13);
        let report = serial(recursive())
            .scan_async(vec![dir.path().to_path_buf()])
            .await
            .unwrap();
        assert_eq!(report.contents.len(), 1);
    }

    #[test]
    fn test_cycle_detection() {
        let chain = vec![Link {
            link: PathBuf::from("/x/l1"),
            resolved: PathBuf::from("/y"),
        }];
        // Back up to the link's own parent
        assert!(is_cycle(Path::new("/y/sub"), &chain, Path::new("/x")));
        // Up to an ancestor of the current directory
        assert!(is_cycle(Path::new("/y/sub"), &chain, Path::new("/y")));
        // Component-wise, not string prefix
        assert!(!is_cycle(Path::new("/y/sub"), &chain, Path::new("/y/s")));
        assert!(!is_cycle(Path::new("/y/sub"), &chain, Path::new("/z")));
    }
}
