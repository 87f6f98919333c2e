//! Grid resync protocol.
//!
//! When the grid switches to another directory (or the cell size changes),
//! every queued or in-flight grid job belongs to a batch nobody wants any
//! more. A resync brings the grid renderer and the thumbnailer to a clean
//! state without stopping them:
//!
//! 1. The coordinator requests a resync from the renderer, then from the
//!    thumbnailer (each handshake goes `InSync -> OutOfSync`).
//! 2. It waits until both have begun (`OutOfSync -> Resyncing`). From then on
//!    neither emits work for the old batch.
//! 3. It queues one delimiter per pool, renderer's first.
//! 4. Each pool discards its stale work, drains its queue up to its delimiter
//!    and reports back in sync.
//!
//! Each resync has its own [`Epoch`] and delimiters carry it, so a pool only
//! ever stops at the delimiter of the resync it is performing. Resyncs are
//! serialised by the coordinator, so every pool sees exactly one delimiter per
//! resync.

use std::time::Duration;

use flume::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::{Epoch, GridMessage, ThumbMessage};

/// How long `wait_started` sleeps between checks of the closed state.
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    InSync,
    /// Resync requested; the pool has not begun yet.
    OutOfSync(Epoch),
    /// The pool is discarding stale work.
    Resyncing(Epoch),
    /// The pool has stopped and will never resync again.
    Closed,
}

/// Per-pool side of the protocol.
#[derive(Debug)]
pub struct Handshake {
    name: &'static str,
    phase: Mutex<SyncPhase>,
    changed: Condvar,
}

impl Handshake {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            phase: Mutex::new(SyncPhase::InSync),
            changed: Condvar::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    /// Coordinator: ask the pool to resync for `epoch`.
    pub fn request(&self, epoch: Epoch) {
        let mut phase = self.phase.lock();
        if *phase != SyncPhase::Closed {
            *phase = SyncPhase::OutOfSync(epoch);
        }
    }

    /// Whether a resync was requested and not yet begun.
    pub fn is_requested(&self) -> bool {
        matches!(self.phase(), SyncPhase::OutOfSync(_))
    }

    /// Whether work of the current batch may be emitted.
    pub fn is_in_sync(&self) -> bool {
        self.phase() == SyncPhase::InSync
    }

    /// Pool: begin a requested resync, returning its epoch.
    pub fn begin(&self) -> Option<Epoch> {
        let mut phase = self.phase.lock();
        let SyncPhase::OutOfSync(epoch) = *phase else {
            return None;
        };
        *phase = SyncPhase::Resyncing(epoch);
        self.changed.notify_all();
        trace!(pool = self.name, epoch = epoch.0, "Resync started");
        Some(epoch)
    }

    /// Pool: the resync for `epoch` is complete.
    pub fn finish(&self, epoch: Epoch) {
        let mut phase = self.phase.lock();
        if *phase == SyncPhase::Resyncing(epoch) {
            *phase = SyncPhase::InSync;
            self.changed.notify_all();
            trace!(pool = self.name, epoch = epoch.0, "Resync finished");
        }
    }

    /// Pool: it is exiting; nobody should wait for it any more.
    pub fn close(&self) {
        *self.phase.lock() = SyncPhase::Closed;
        self.changed.notify_all();
    }

    /// Block while a requested resync has not begun.
    pub fn wait_started(&self) {
        let mut phase = self.phase.lock();
        while matches!(*phase, SyncPhase::OutOfSync(_)) {
            self.changed.wait_for(&mut phase, WAIT_SLICE);
        }
    }

    /// Block until back in sync (or closed), up to `timeout`. Returns whether
    /// the pool is in sync.
    pub fn wait_in_sync(&self, timeout: Duration) -> bool {
        let mut phase = self.phase.lock();
        if !matches!(*phase, SyncPhase::InSync | SyncPhase::Closed) {
            self.changed
                .wait_while_for(&mut phase, |p| !matches!(p, SyncPhase::InSync | SyncPhase::Closed), timeout);
        }
        *phase == SyncPhase::InSync
    }
}

/// Coordinator side of the protocol.
pub struct ResyncCoordinator {
    epoch: Mutex<Epoch>,
    renderer: Handshake,
    thumbnailer: Option<Handshake>,
    grid_tx: Sender<GridMessage>,
    thumb_tx: Option<Sender<ThumbMessage>>,
}

impl ResyncCoordinator {
    /// `thumb_tx` is `None` when thumbnailing is disabled.
    pub fn new(grid_tx: Sender<GridMessage>, thumb_tx: Option<Sender<ThumbMessage>>) -> Self {
        Self {
            epoch: Mutex::new(Epoch::default()),
            renderer: Handshake::new("GridRenderer"),
            thumbnailer: thumb_tx.as_ref().map(|_| Handshake::new("GridThumbnailer")),
            grid_tx,
            thumb_tx,
        }
    }

    pub fn renderer(&self) -> &Handshake {
        &self.renderer
    }

    pub fn thumbnailer(&self) -> Option<&Handshake> {
        self.thumbnailer.as_ref()
    }

    /// Discard the current grid batch. Returns the resync epoch.
    ///
    /// Blocks until both pools have begun resyncing, not until they finish.
    pub fn resync(&self) -> Epoch {
        let mut current = self.epoch.lock();
        *current = current.next();
        let epoch = *current;
        debug!(epoch = epoch.0, "Resyncing grid rendering");

        self.renderer.request(epoch);
        if let Some(thumbnailer) = &self.thumbnailer {
            thumbnailer.request(epoch);
        }

        self.renderer.wait_started();
        if let Some(thumbnailer) = &self.thumbnailer {
            thumbnailer.wait_started();
        }

        let _ = self.grid_tx.send(GridMessage::Delimiter(epoch));
        if let Some(thumb_tx) = &self.thumb_tx {
            let _ = thumb_tx.send(ThumbMessage::Delimiter(epoch));
        }

        epoch
    }

    /// Mark both pools closed so a resync never waits for them.
    pub fn close(&self) {
        self.renderer.close();
        if let Some(thumbnailer) = &self.thumbnailer {
            thumbnailer.close();
        }
    }
}
