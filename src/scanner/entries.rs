//! Entry scanner.
//!
//! Streams the displayable entries of one directory (images, and directories
//! with content) in display order, on a dedicated thread. A scan in progress
//! can be interrupted; [`EntryScanner::interrupt`] returns only once the
//! worker has acknowledged, so a new scan never overlaps the old one.
//!
//! Every event carries the generation of the request that produced it, so
//! consumers can drop anything from a superseded scan.

use std::cmp::Ordering as CmpOrdering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::tree::ContentTree;
use super::{is_hidden, probe_image, Probe};
use crate::pipeline::RedrawSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Image,
    Directory,
}

/// One displayable entry of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
}

/// Display order key: directories first, then by case-insensitive name with
/// leading dots ignored; a hidden entry sorts just before the visible entry
/// with the same name. Names equal up to case fall back to the raw name, so
/// the order never depends on the directory listing.
pub fn sort_key(name: &str, is_file: bool) -> (bool, String, bool, &str) {
    let hidden = is_hidden(name);
    (
        is_file,
        name.trim_start_matches('.').to_lowercase(),
        !hidden,
        name,
    )
}

fn compare(a: &(String, bool), b: &(String, bool)) -> CmpOrdering {
    sort_key(&a.0, a.1).cmp(&sort_key(&b.0, b.1))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub show_hidden: bool,
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOutcome {
    Complete { unreadable: usize },
    Interrupted,
}

/// List `dir` in display order, emitting each displayable entry.
///
/// `tree` is the content tree of `dir`: files are only probed when it says
/// the directory has images, and only sub-directories it contains are listed.
/// Listing starts after the entry named `resume_after` when it is still
/// present, otherwise from the beginning. `should_stop` is polled between
/// entries.
pub fn list_entries(
    dir: &Path,
    tree: &ContentTree,
    resume_after: Option<&str>,
    options: ListOptions,
    should_stop: &mut dyn FnMut() -> bool,
    emit: &mut dyn FnMut(Entry),
) -> std::io::Result<ListOutcome> {
    let mut names: Vec<(String, bool)> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Follows symlinks
            let is_file = fs::metadata(entry.path()).is_ok_and(|m| m.is_file());
            (name, is_file)
        })
        .collect();
    names.sort_by(compare);

    let start = resume_after
        .and_then(|after| names.iter().position(|(name, _)| name == after))
        .map_or(0, |pos| pos + 1);

    let mut unreadable = 0;
    for (name, is_file) in names.into_iter().skip(start) {
        if should_stop() {
            return Ok(ListOutcome::Interrupted);
        }
        if !options.show_hidden && is_hidden(&name) {
            continue;
        }

        if is_file {
            if !tree.has_images() {
                continue;
            }
            match probe_image(&dir.join(&name)) {
                Probe::Image => emit(Entry {
                    name,
                    kind: EntryKind::Image,
                }),
                Probe::Unknown => {}
                Probe::Unreadable(reason) => {
                    debug!(?dir, file = %name, %reason, "Unreadable image");
                    unreadable += 1;
                }
            }
        } else if options.recursive && tree.contains(&name) {
            emit(Entry {
                name,
                kind: EntryKind::Directory,
            });
        }
    }

    Ok(ListOutcome::Complete { unreadable })
}

/// A request to list one directory.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub generation: u64,
    pub dir: PathBuf,
    pub tree: Arc<ContentTree>,
    pub resume_after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryEvent {
    Entry { generation: u64, entry: Entry },
    /// The listing completed.
    Done { generation: u64, unreadable: usize },
    /// The directory could not be listed.
    Failed { generation: u64 },
}

impl EntryEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Entry { generation, .. }
            | Self::Done { generation, .. }
            | Self::Failed { generation } => *generation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scanning,
    Interrupting,
}

/// Interrupt handshake state, shared with the worker.
#[derive(Debug)]
struct Control {
    generation: u64,
    phase: Phase,
}

struct Shared {
    control: Mutex<Control>,
    ack_tx: Sender<()>,
}

impl Shared {
    /// Worker side: acknowledge a pending interrupt of `generation`.
    fn stop_requested(&self, generation: u64) -> bool {
        let mut control = self.control.lock();
        if control.generation == generation && control.phase == Phase::Interrupting {
            control.phase = Phase::Idle;
            let _ = self.ack_tx.send(());
            true
        } else {
            false
        }
    }

    /// Worker side: `generation` is over, acknowledging a late interrupt.
    fn finish(&self, generation: u64) {
        let mut control = self.control.lock();
        if control.generation == generation {
            if control.phase == Phase::Interrupting {
                let _ = self.ack_tx.send(());
            }
            control.phase = Phase::Idle;
        }
    }
}

/// Background directory lister with an interruptible request queue.
pub struct EntryScanner {
    name: &'static str,
    requests: Sender<Option<EntryRequest>>,
    events: Receiver<EntryEvent>,
    shared: Arc<Shared>,
    ack_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl EntryScanner {
    /// Start the worker thread. `redraw` is notified after every event.
    pub fn spawn(name: &'static str, options: ListOptions, redraw: RedrawSignal) -> std::io::Result<Self> {
        let (requests, request_rx) = flume::bounded::<Option<EntryRequest>>(1);
        let (event_tx, events) = flume::unbounded();
        let (ack_tx, ack_rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                generation: 0,
                phase: Phase::Idle,
            }),
            ack_tx,
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("Entry scanner started");
            while let Ok(Some(request)) = request_rx.recv() {
                scan_request(&request, options, &worker_shared, &event_tx, &redraw);
            }
            debug!("Entry scanner stopped");
        })?;

        Ok(Self {
            name,
            requests,
            events,
            shared,
            ack_rx,
            handle: Some(handle),
        })
    }

    /// List `dir`, interrupting any scan in progress first.
    ///
    /// Returns the generation tagging this listing's events.
    pub fn request(&self, dir: &Path, tree: Arc<ContentTree>, resume_after: Option<String>) -> u64 {
        self.interrupt();
        let generation = {
            let mut control = self.shared.control.lock();
            control.generation += 1;
            control.phase = Phase::Scanning;
            control.generation
        };
        debug!(scanner = self.name, ?dir, generation, "Listing directory");
        let _ = self.requests.send(Some(EntryRequest {
            generation,
            dir: dir.to_path_buf(),
            tree,
            resume_after,
        }));
        generation
    }

    /// Stop the scan in progress, if any, and wait for the acknowledgement.
    ///
    /// Returns whether a scan was interrupted.
    pub fn interrupt(&self) -> bool {
        {
            let mut control = self.shared.control.lock();
            if control.phase != Phase::Scanning {
                return false;
            }
            control.phase = Phase::Interrupting;
        }
        // The worker always acknowledges an interrupting generation, either
        // between entries or when it finishes.
        let _ = self.ack_rx.recv();
        true
    }

    /// Whether the latest listing has finished (or was interrupted).
    pub fn is_idle(&self) -> bool {
        self.shared.control.lock().phase == Phase::Idle
    }

    pub fn current_generation(&self) -> u64 {
        self.shared.control.lock().generation
    }

    pub fn events(&self) -> &Receiver<EntryEvent> {
        &self.events
    }

    /// Stop the worker thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.interrupt();
            let _ = self.requests.send(None);
            if handle.join().is_err() {
                warn!(scanner = self.name, "Entry scanner panicked");
            }
        }
    }
}

impl Drop for EntryScanner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scan_request(
    request: &EntryRequest,
    options: ListOptions,
    shared: &Shared,
    events: &Sender<EntryEvent>,
    redraw: &RedrawSignal,
) {
    let generation = request.generation;
    if shared.stop_requested(generation) {
        return;
    }

    let result = list_entries(
        &request.dir,
        &request.tree,
        request.resume_after.as_deref(),
        options,
        &mut || shared.stop_requested(generation),
        &mut |entry| {
            let _ = events.send(EntryEvent::Entry { generation, entry });
            redraw.notify();
        },
    );

    match result {
        Ok(ListOutcome::Complete { unreadable }) => {
            if unreadable > 0 {
                warn!(dir = ?request.dir, unreadable, "Some images could not be read");
            }
            let _ = events.send(EntryEvent::Done {
                generation,
                unreadable,
            });
            redraw.notify();
        }
        // Already acknowledged
        Ok(ListOutcome::Interrupted) => return,
        Err(e) => {
            warn!(dir = ?request.dir, error = %e, "Could not list directory");
            let _ = events.send(EntryEvent::Failed { generation });
            redraw.notify();
        }
    }
    shared.finish(generation);
}
